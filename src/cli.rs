use crate::logging::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "devstack",
    version,
    about = "Bring up, health-check and tear down a local development stack"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "Path to devstack.yaml (default: DEVSTACK_CONFIG, then the nearest ancestor)"
    )]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,
    #[arg(long = "log-level", global = true, value_enum)]
    pub log_level: Option<LogLevel>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },
    Network {
        #[command(subcommand)]
        command: NetworkCommand,
    },
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
    Backend {
        #[command(subcommand)]
        command: BackendCommand,
    },
    #[command(about = "Full validation run with guaranteed teardown")]
    Validate {
        #[arg(long, default_value_t = false)]
        keep_running: bool,
        #[arg(last = true)]
        test_command: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Subcommand, Debug)]
pub enum EnvCommand {
    Detect,
    Show,
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    Ensure {
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommand {
    Render {
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },
    Stage {
        #[arg(long, default_value_t = false, help = "Stage outside the allowed staging roots")]
        force: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum BackendCommand {
    Start {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    Stop {
        #[arg(long)]
        port: Option<u16>,
    },
    Restart {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    Status {
        #[arg(long)]
        port: Option<u16>,
    },
    Logs {
        #[arg(long, default_value_t = 50)]
        lines: usize,
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn validate_takes_trailing_test_command() {
        let cli = Cli::parse_from([
            "devstack",
            "validate",
            "--keep-running",
            "--",
            "pytest",
            "-k",
            "login",
        ]);
        match cli.command {
            Commands::Validate {
                keep_running,
                test_command,
            } => {
                assert!(keep_running);
                assert_eq!(test_command, vec!["pytest", "-k", "login"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["devstack", "backend", "start", "--port", "5200", "--json"]);
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Backend {
                command: BackendCommand::Start { port: Some(5200), .. }
            }
        ));
    }
}

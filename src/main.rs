mod cli;
mod config;
mod detect;
mod docker;
mod driver;
mod error;
mod files;
mod health;
mod logging;
mod network;
mod output;
mod poll;
mod process;
mod render;
mod stage;
mod supervisor;

use clap::Parser;
use cli::{BackendCommand, Cli, Commands, ConfigCommand, EnvCommand, NetworkCommand, ProxyCommand};
use config::{
    read_config, resolve_config_path, Config, Workspace, CONFIG_ENV, CONFIG_FILE_NAME,
    DEFAULT_CONFIG_YAML, DEFAULT_PROXY_TEMPLATE,
};
use detect::{EnvKind, EnvironmentProfile, HostFacts};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use docker::RealDockerRunner;
use driver::{Driver, RunOptions};
use error::{DevstackError, Result};
use files::ensure_parent;
use health::HttpHealthProbe;
use output::Output;
use process::SystemHost;
use serde_json::json;
use std::env;
use std::fs::{self, File};
use std::io::{self, IsTerminal, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use supervisor::{ProcessState, Supervisor, SupervisorSettings};
use tracing::{debug, info};

struct Context {
    cfg: Config,
    workspace: Workspace,
}

fn start_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.workspace {
        Some(dir) => Ok(dir.clone()),
        None => Ok(env::current_dir()?),
    }
}

fn load_context(cli: &Cli) -> Result<Context> {
    let path = resolve_config_path(cli.config.as_ref(), &start_dir(cli)?)?;
    let cfg = read_config(&path)?;
    let workspace = Workspace::from_config_path(&path, &cfg)?;
    debug!(config = %path.display(), root = %workspace.root.display(), "workspace resolved");
    Ok(Context { cfg, workspace })
}

fn detect_and_publish(ctx: &Context) -> Result<EnvironmentProfile> {
    let profile = detect::detect(&ctx.workspace, &ctx.cfg, &HostFacts::gather(), &RealDockerRunner)?;
    detect::publish(&profile, &ctx.workspace.env_file())?;
    Ok(profile)
}

fn current_profile(ctx: &Context) -> Result<EnvironmentProfile> {
    let path = ctx.workspace.env_file();
    if path.exists() {
        return detect::load_profile(&path);
    }
    detect_and_publish(ctx)
}

fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level);
    let out = Output { json: cli.json };

    let result = match &cli.command {
        Commands::Config { command } => handle_config(&cli, &out, command),
        Commands::Env { command } => handle_env(&cli, &out, command),
        Commands::Network { command } => handle_network(&cli, &out, command),
        Commands::Proxy { command } => handle_proxy(&cli, &out, command),
        Commands::Backend { command } => handle_backend(&cli, &out, command),
        Commands::Validate {
            keep_running,
            test_command,
        } => handle_validate(&cli, &out, *keep_running, test_command),
    };

    if let Err(err) = result {
        if err.is_benign() {
            info!(reason = %err, "nothing to do");
            let _ = out.emit(&err.to_string(), &json!({"noop": true, "message": err.to_string()}));
            return;
        }
        let _ = out.emit_error(&err);
        std::process::exit(err.exit_code());
    }
}

fn handle_config(cli: &Cli, out: &Output, command: &ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init => {
            let path = match (&cli.config, env::var(CONFIG_ENV)) {
                (Some(path), _) => path.clone(),
                (None, Ok(path)) if !path.trim().is_empty() => PathBuf::from(path),
                _ => start_dir(cli)?.join(CONFIG_FILE_NAME),
            };
            let created = write_if_absent(&path, DEFAULT_CONFIG_YAML)?;
            let cfg = read_config(&path)?;
            let workspace = Workspace::from_config_path(&path, &cfg)?;
            let template = workspace.resolve(&cfg.proxy.template);
            let template_created = write_if_absent(&template, DEFAULT_PROXY_TEMPLATE)?;
            let summary = if created {
                format!("created {}", path.display())
            } else {
                format!("{} already exists; left unchanged", path.display())
            };
            out.emit(
                &summary,
                &json!({
                    "path": workspace.config_path,
                    "created": created,
                    "template": template,
                    "template_created": template_created,
                }),
            )
        }
        ConfigCommand::Validate => {
            let ctx = load_context(cli)?;
            out.emit(
                &format!("{} is valid", ctx.workspace.config_path.display()),
                &json!({"path": ctx.workspace.config_path, "valid": true}),
            )
        }
    }
}

fn write_if_absent(path: &Path, content: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    ensure_parent(path)?;
    fs::write(path, content)?;
    Ok(true)
}

fn handle_env(cli: &Cli, out: &Output, command: &EnvCommand) -> Result<()> {
    let ctx = load_context(cli)?;
    let profile = match command {
        EnvCommand::Detect => detect_and_publish(&ctx)?,
        EnvCommand::Show => detect::load_profile(&ctx.workspace.env_file())?,
    };
    let summary = profile
        .to_env_map()
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n");
    out.emit(
        &summary,
        &json!({"profile": profile, "env_file": ctx.workspace.env_file()}),
    )
}

fn handle_network(cli: &Cli, out: &Output, command: &NetworkCommand) -> Result<()> {
    let NetworkCommand::Ensure { name } = command;
    let ctx = load_context(cli)?;
    let profile = current_profile(&ctx)?;
    let name = name.clone().unwrap_or_else(|| ctx.cfg.network.name.clone());
    let member = match profile.kind {
        EnvKind::Container => profile.container_id.as_deref(),
        EnvKind::Ci | EnvKind::Bare => None,
    };
    let report = network::ensure(&RealDockerRunner, &name, member)?;
    let mut summary = format!(
        "network {} {}",
        report.name,
        if report.created { "created" } else { "present" }
    );
    if let Some(member) = &report.member {
        summary.push_str(&format!(
            "; {member} {}",
            if report.attached { "attached" } else { "already attached" }
        ));
    }
    out.emit(&summary, &report)
}

fn handle_proxy(cli: &Cli, out: &Output, command: &ProxyCommand) -> Result<()> {
    let ctx = load_context(cli)?;
    let profile = current_profile(&ctx)?;
    match command {
        ProxyCommand::Render { vars } => {
            let overrides = render::parse_var_overrides(vars)?;
            let rendered = render::render_proxy_config(&ctx.cfg, &ctx.workspace, &profile, &overrides)?;
            let state = if rendered.changed { "rendered" } else { "unchanged" };
            out.emit(
                &format!("{state} {}", rendered.output_path.display()),
                &rendered,
            )
        }
        ProxyCommand::Stage { force, yes } => {
            if *force && !*yes && io::stdin().is_terminal() {
                let proceed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!(
                        "Stage outside the allowed roots ({})? The destination will be wiped.",
                        ctx.cfg.proxy.allowed_stage_roots.join(", ")
                    ))
                    .default(false)
                    .interact()
                    .map_err(|err| DevstackError::Process(format!("prompt failed: {err}")))?;
                if !proceed {
                    return Err(DevstackError::Process("staging cancelled".to_string()));
                }
            }
            let staged =
                stage::stage_proxy_assets(&RealDockerRunner, &ctx.cfg, &ctx.workspace, &profile, *force)?;
            let summary = staged
                .iter()
                .map(|asset| {
                    format!(
                        "staged {} -> {} ({} files, {})",
                        asset.source_directory.display(),
                        asset.destination_directory.display(),
                        asset.files.len(),
                        asset.mode
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            out.emit(&summary, &staged)
        }
    }
}

fn handle_backend(cli: &Cli, out: &Output, command: &BackendCommand) -> Result<()> {
    let ctx = load_context(cli)?;
    let (port, workdir) = match command {
        BackendCommand::Start { port, workdir } | BackendCommand::Restart { port, workdir } => {
            (*port, workdir.as_deref())
        }
        BackendCommand::Stop { port } | BackendCommand::Status { port } => (*port, None),
        BackendCommand::Logs { .. } => (None, None),
    };
    let settings = SupervisorSettings::from_config(&ctx.cfg.backend, &ctx.workspace, port, workdir);
    let probe = HttpHealthProbe::new()?;
    let supervisor = Supervisor::new(settings, &SystemHost, &probe);

    match command {
        BackendCommand::Start { .. } | BackendCommand::Restart { .. } => {
            let process = if matches!(command, BackendCommand::Restart { .. }) {
                supervisor.restart()?
            } else {
                supervisor.start()?
            };
            out.emit(
                &format!(
                    "backend {} with PID {} on port {} (log: {})",
                    style("running").green(),
                    process.pid,
                    process.bound_port,
                    process.log_path.display()
                ),
                &process,
            )
        }
        BackendCommand::Stop { .. } => {
            let stopped = supervisor.stop()?;
            out.emit(&format!("stopped backend PID {}", stopped.pid), &stopped)
        }
        BackendCommand::Status { .. } => {
            let status = supervisor.status();
            let state = match status.state {
                ProcessState::Running => style(status.state.to_string()).green(),
                ProcessState::Crashed => style(status.state.to_string()).red(),
                _ => style(status.state.to_string()).yellow(),
            };
            let pid = status
                .pid
                .map(|pid| format!(" PID {pid}"))
                .unwrap_or_default();
            out.emit(
                &format!(
                    "backend {state}{pid} port {} (log: {})",
                    status.port,
                    status.log_path.display()
                ),
                &status,
            )
        }
        BackendCommand::Logs { lines, follow } => {
            if *follow && out.json {
                return Err(DevstackError::Config(
                    "--follow cannot be combined with --json".to_string(),
                ));
            }
            let tail = supervisor.logs(*lines)?;
            out.emit(&tail.join("\n"), &json!({"path": ctx.workspace.log_file(), "lines": tail}))?;
            if *follow {
                follow_log(&ctx.workspace.log_file())?;
            }
            Ok(())
        }
    }
}

fn follow_log(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut offset = file.seek(SeekFrom::End(0))?;
    let mut stdout = io::stdout();
    loop {
        let len = fs::metadata(path)?.len();
        if len < offset {
            // truncated or replaced
            file = File::open(path)?;
            offset = 0;
        }
        if len > offset {
            file.seek(SeekFrom::Start(offset))?;
            let mut chunk = Vec::new();
            (&mut file).take(len - offset).read_to_end(&mut chunk)?;
            stdout.write_all(&chunk)?;
            stdout.flush()?;
            offset = len;
        }
        thread::sleep(Duration::from_millis(500));
    }
}

fn handle_validate(cli: &Cli, out: &Output, keep_running: bool, test_command: &[String]) -> Result<()> {
    let ctx = load_context(cli)?;
    // A validation run always starts from a fresh detection.
    let profile = detect_and_publish(&ctx)?;
    let probe = HttpHealthProbe::new()?;
    let driver = Driver {
        cfg: &ctx.cfg,
        workspace: &ctx.workspace,
        profile: &profile,
        runner: &RealDockerRunner,
        host: &SystemHost,
        probe: &probe,
    };
    let opts = RunOptions {
        keep_running,
        test_command: test_command.to_vec(),
    };
    let report = driver.run(&opts)?;

    let code = report.test_exit_code.unwrap_or(0);
    let verdict = if code == 0 {
        style("passed").green()
    } else {
        style("failed").red()
    };
    let mut summary = format!("validation {verdict} ({} steps)", report.steps.len());
    if report.kept_running {
        summary.push_str("; stack left running");
    }
    out.emit(&summary, &report)?;
    if code != 0 {
        let command = if test_command.is_empty() {
            ctx.cfg.test.command.join(" ")
        } else {
            test_command.join(" ")
        };
        return Err(DevstackError::TestFailed { command, code });
    }
    Ok(())
}

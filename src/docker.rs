use crate::error::{DevstackError, ErrorDetails, Result};
use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub trait DockerRunner {
    fn run(&self, args: &[String], stdin: Option<&[u8]>) -> io::Result<CommandOutput>;
}

pub struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(&self, args: &[String], stdin: Option<&[u8]>) -> io::Result<CommandOutput> {
        let mut cmd = Command::new("docker");
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = cmd.spawn()?;
        // Feed stdin from a separate thread so a chatty child cannot
        // deadlock on a full stdout pipe.
        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => {
                let bytes = bytes.to_vec();
                Some(thread::spawn(move || pipe.write_all(&bytes)))
            }
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            match handle.join() {
                Ok(Err(err)) if err.kind() != io::ErrorKind::BrokenPipe => return Err(err),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "stdin writer thread panicked",
                    ))
                }
                _ => {}
            }
        }
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

pub fn docker_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

pub fn render_docker_command(args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push("docker".to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn docker_spawn_error_details(err: &io::Error, command: &str) -> ErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("permission denied while trying to connect to the docker daemon") {
        return (
            "docker_permission_denied".to_string(),
            Some(
                "The current user cannot reach the Docker socket. Add it to the socket's group (see DEVSTACK_NETWORK_GID) and start a new login shell."
                    .to_string(),
            ),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some(
                "Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry."
                    .to_string(),
            ),
        );
    }

    if lower.contains("port is already allocated")
        || lower.contains("bind: address already in use")
        || lower.contains("address already in use")
    {
        return (
            "docker_port_conflict".to_string(),
            Some(
                "A required host port is already in use. Free the conflicting port or change it in devstack.yaml."
                    .to_string(),
            ),
        );
    }

    if lower.contains("is already in use by container") {
        return (
            "docker_name_conflict".to_string(),
            Some("Remove the stale container with `docker rm -f <name>` and retry.".to_string()),
        );
    }

    if lower.contains("pull access denied")
        || lower.contains("unauthorized")
        || lower.contains("authentication required")
    {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login` for private images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

pub fn execute_docker<R: DockerRunner + ?Sized>(
    runner: &R,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<CommandOutput> {
    let command = render_docker_command(args);
    debug!(command = %command, "running docker");
    let cmd_output = runner.run(args, stdin).map_err(|err| {
        let details = docker_spawn_error_details(&err, &command);
        DevstackError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details,
        }
    })?;
    if !cmd_output.success() {
        let stderr = cmd_output.stderr_text();
        let (error_code, hint) = classify_docker_command_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(DevstackError::ProcessDetailed {
            message,
            details: ErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
            },
        });
    }
    Ok(cmd_output)
}

// Like `execute_docker`, but a non-zero exit comes back as output.
pub fn probe_docker<R: DockerRunner + ?Sized>(runner: &R, args: &[String]) -> Result<CommandOutput> {
    let command = render_docker_command(args);
    debug!(command = %command, "probing docker");
    runner.run(args, None).map_err(|err| {
        let details = docker_spawn_error_details(&err, &command);
        DevstackError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details,
        }
    })
}


#[cfg(test)]
mod tests {
    use super::testing::MockDockerRunner;
    use super::*;

    #[test]
    fn render_quotes_whitespace_arguments() {
        let args = docker_args(&["run", "--rm", "alpine", "sh", "-c", "echo hi"]);
        assert_eq!(
            render_docker_command(&args),
            "docker run --rm alpine sh -c \"echo hi\""
        );
    }

    #[test]
    fn classify_daemon_unreachable() {
        let (code, hint) = classify_docker_command_failure(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert_eq!(code, "docker_daemon_unreachable");
        assert!(hint.unwrap().contains("Start Docker"));
    }

    #[test]
    fn classify_permission_denied_before_daemon_checks() {
        let (code, _) = classify_docker_command_failure(
            "permission denied while trying to connect to the Docker daemon socket at unix:///var/run/docker.sock",
        );
        assert_eq!(code, "docker_permission_denied");
    }

    #[test]
    fn execute_docker_surfaces_stderr_and_command() {
        let runner = MockDockerRunner::default();
        runner.push_failure("Error response from daemon: port is already allocated");
        let err = execute_docker(&runner, &docker_args(&["run", "nginx"]), None)
            .expect_err("should fail");
        let details = err.details().expect("details");
        assert_eq!(details.error_code, "docker_port_conflict");
        assert_eq!(details.command.as_deref(), Some("docker run nginx"));
        assert!(err.to_string().contains("port is already allocated"));
    }

    #[test]
    fn probe_docker_returns_failed_output() {
        let runner = MockDockerRunner::default();
        runner.push_failure("Error: No such network: devnet");
        let out = probe_docker(&runner, &docker_args(&["network", "inspect", "devnet"])).unwrap();
        assert!(!out.success());
        assert!(out.stderr_text().contains("No such network"));
    }
}

use crate::docker::{docker_args, execute_docker, probe_docker, render_docker_command, DockerRunner};
use crate::error::{DevstackError, ErrorDetails, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

const MEMBERS_FORMAT: &str = "{{range $id, $c := .Containers}}{{$id}} {{$c.Name}}\n{{end}}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkReport {
    pub name: String,
    pub created: bool,
    pub attached: bool,
    pub member: Option<String>,
}

// Makes sure `name` exists and, when `member` is given, that the container
// is attached to it. Both halves are check-then-act; a concurrent actor
// winning the race is tolerated by re-checking rather than trusting the
// create/connect result.
pub fn ensure<R: DockerRunner + ?Sized>(
    runner: &R,
    name: &str,
    member: Option<&str>,
) -> Result<NetworkReport> {
    let mut created = false;
    if network_exists(runner, name)? {
        debug!(network = name, "network already exists");
    } else {
        created = create_network(runner, name)?;
        if !network_exists(runner, name)? {
            return Err(network_error(
                name,
                "create reported success but the network is still absent",
                None,
            ));
        }
    }

    let mut attached = false;
    if let Some(member) = member {
        if is_member(runner, name, member)? {
            debug!(network = name, member, "already attached");
        } else {
            attached = connect(runner, name, member)?;
            if !is_member(runner, name, member)? {
                return Err(network_error(
                    name,
                    &format!("{member} is not attached after `docker network connect`"),
                    None,
                ));
            }
        }
    }

    Ok(NetworkReport {
        name: name.to_string(),
        created,
        attached,
        member: member.map(str::to_string),
    })
}

pub fn network_exists<R: DockerRunner + ?Sized>(runner: &R, name: &str) -> Result<bool> {
    let args = docker_args(&["network", "inspect", "--format", "{{.Name}}", name]);
    let out = probe_docker(runner, &args).map_err(|err| wrap(name, err))?;
    if out.success() {
        return Ok(true);
    }
    let stderr = out.stderr_text();
    let lower = stderr.to_lowercase();
    if lower.contains("no such network") || lower.contains("not found") {
        return Ok(false);
    }
    Err(failed_command(name, &args, &stderr, "inspect"))
}

pub fn list_members<R: DockerRunner + ?Sized>(runner: &R, name: &str) -> Result<Vec<(String, String)>> {
    let args = docker_args(&["network", "inspect", "--format", MEMBERS_FORMAT, name]);
    let out = execute_docker(runner, &args, None).map_err(|err| wrap(name, err))?;
    Ok(out
        .stdout_text()
        .lines()
        .filter_map(|line| {
            let (id, container) = line.trim().split_once(' ')?;
            Some((id.to_string(), container.to_string()))
        })
        .collect())
}

fn is_member<R: DockerRunner + ?Sized>(runner: &R, name: &str, member: &str) -> Result<bool> {
    Ok(list_members(runner, name)?
        .iter()
        .any(|(id, container)| id.starts_with(member) || container == member))
}

fn create_network<R: DockerRunner + ?Sized>(runner: &R, name: &str) -> Result<bool> {
    let args = docker_args(&["network", "create", name]);
    let out = probe_docker(runner, &args).map_err(|err| wrap(name, err))?;
    if out.success() {
        info!(network = name, "network created");
        return Ok(true);
    }
    let stderr = out.stderr_text();
    if stderr.to_lowercase().contains("already exists") {
        warn!(network = name, "network appeared concurrently; re-validating");
        return Ok(false);
    }
    Err(failed_command(name, &args, &stderr, "create"))
}

fn connect<R: DockerRunner + ?Sized>(runner: &R, name: &str, member: &str) -> Result<bool> {
    let args = docker_args(&["network", "connect", name, member]);
    let out = probe_docker(runner, &args).map_err(|err| wrap(name, err))?;
    if out.success() {
        info!(network = name, member, "attached to network");
        return Ok(true);
    }
    let stderr = out.stderr_text();
    if stderr.to_lowercase().contains("already exists in network") {
        warn!(network = name, member, "member attached concurrently; re-validating");
        return Ok(false);
    }
    Err(failed_command(name, &args, &stderr, "connect"))
}

fn failed_command(name: &str, args: &[String], stderr: &str, action: &str) -> DevstackError {
    let command = render_docker_command(args);
    let (error_code, hint) = crate::docker::classify_docker_command_failure(stderr);
    network_error(
        name,
        &format!("{action} failed while running `{command}`: {stderr}"),
        Some(ErrorDetails {
            error_code,
            hint,
            command: Some(command),
            raw_stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
        }),
    )
}

fn network_error(name: &str, message: &str, details: Option<ErrorDetails>) -> DevstackError {
    DevstackError::Network {
        network: name.to_string(),
        message: message.to_string(),
        details,
    }
}

fn wrap(name: &str, err: DevstackError) -> DevstackError {
    match err {
        DevstackError::ProcessDetailed { message, details } => {
            network_error(name, &message, Some(details))
        }
        other => network_error(name, &other.to_string(), None),
    }
}

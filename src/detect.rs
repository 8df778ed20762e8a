use crate::config::{Config, Workspace, CONFIG_FILE_NAME};
use crate::docker::{docker_args, probe_docker, DockerRunner};
use crate::error::{DevstackError, Result};
use crate::files::{read_env_file, write_env_file};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const CI_MARKER_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
    "CIRCLECI",
];
const CONTAINER_PLATFORM_VARS: &[&str] = &["REMOTE_CONTAINERS", "CODESPACES", "DEVCONTAINER", "container"];
const CONTAINER_MARKER_FILE: &str = "/.dockerenv";
const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const FQDN_FALLBACK: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvKind {
    Ci,
    Container,
    Bare,
}

impl EnvKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKind::Ci => "ci",
            EnvKind::Container => "container",
            EnvKind::Bare => "bare",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "ci" => Some(EnvKind::Ci),
            "container" => Some(EnvKind::Container),
            "bare" => Some(EnvKind::Bare),
            _ => None,
        }
    }
}

impl fmt::Display for EnvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentProfile {
    pub kind: EnvKind,
    pub user_id: u32,
    pub group_id: u32,
    pub workspace_path: PathBuf,
    // Set only when the workspace is bind-mounted from a different host path.
    pub physical_host_path: Option<PathBuf>,
    pub network_group_id: u32,
    pub container_id: Option<String>,
    pub fqdn: String,
}

impl EnvironmentProfile {
    pub fn host_workspace_path(&self) -> &Path {
        self.physical_host_path
            .as_deref()
            .unwrap_or(&self.workspace_path)
    }

    pub fn to_env_map(&self) -> BTreeMap<String, String> {
        let mut envs = BTreeMap::new();
        envs.insert("DEVSTACK_ENV_KIND".to_string(), self.kind.to_string());
        envs.insert("DEVSTACK_UID".to_string(), self.user_id.to_string());
        envs.insert("DEVSTACK_GID".to_string(), self.group_id.to_string());
        envs.insert(
            "DEVSTACK_WORKSPACE".to_string(),
            self.workspace_path.to_string_lossy().to_string(),
        );
        envs.insert(
            "DEVSTACK_HOST_WORKSPACE".to_string(),
            self.host_workspace_path().to_string_lossy().to_string(),
        );
        envs.insert(
            "DEVSTACK_NETWORK_GID".to_string(),
            self.network_group_id.to_string(),
        );
        envs.insert("DEVSTACK_FQDN".to_string(), self.fqdn.clone());
        if let Some(id) = &self.container_id {
            envs.insert("DEVSTACK_CONTAINER_ID".to_string(), id.clone());
        }
        envs
    }

    pub fn from_env_map(envs: &BTreeMap<String, String>) -> Result<Self> {
        fn field<'a>(envs: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
            envs.get(key).map(String::as_str).ok_or_else(|| {
                DevstackError::Config(format!("published environment is missing {key}"))
            })
        }
        fn number(envs: &BTreeMap<String, String>, key: &str) -> Result<u32> {
            let raw = field(envs, key)?;
            raw.parse::<u32>().map_err(|_| {
                DevstackError::Config(format!("published environment has invalid {key}={raw}"))
            })
        }
        let kind_raw = field(envs, "DEVSTACK_ENV_KIND")?;
        let kind = EnvKind::parse(kind_raw).ok_or_else(|| {
            DevstackError::Config(format!("published environment has unknown kind '{kind_raw}'"))
        })?;
        let workspace_path = PathBuf::from(field(envs, "DEVSTACK_WORKSPACE")?);
        let host = PathBuf::from(field(envs, "DEVSTACK_HOST_WORKSPACE")?);
        Ok(EnvironmentProfile {
            kind,
            user_id: number(envs, "DEVSTACK_UID")?,
            group_id: number(envs, "DEVSTACK_GID")?,
            physical_host_path: (host != workspace_path).then_some(host),
            workspace_path,
            network_group_id: number(envs, "DEVSTACK_NETWORK_GID")?,
            container_id: envs.get("DEVSTACK_CONTAINER_ID").cloned(),
            fqdn: field(envs, "DEVSTACK_FQDN")?.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub vars: BTreeMap<String, String>,
    pub container_marker: bool,
    pub user_id: u32,
    pub group_id: u32,
    pub docker_socket_gid: Option<u32>,
    pub fqdn: Option<String>,
}

impl HostFacts {
    pub fn gather() -> Self {
        let vars: BTreeMap<String, String> = env::vars().collect();
        let docker_socket_gid = docker_socket_path(&vars).and_then(|path| file_gid(&path));
        HostFacts {
            container_marker: Path::new(CONTAINER_MARKER_FILE).exists(),
            user_id: current_uid(),
            group_id: current_gid(),
            docker_socket_gid,
            fqdn: host_fqdn(),
            vars,
        }
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

pub fn classify(facts: &HostFacts) -> EnvKind {
    if CI_MARKER_VARS
        .iter()
        .any(|key| facts.var(key).is_some_and(|v| v != "false" && v != "0"))
    {
        return EnvKind::Ci;
    }
    if facts.container_marker && CONTAINER_PLATFORM_VARS.iter().any(|key| facts.var(key).is_some()) {
        return EnvKind::Container;
    }
    EnvKind::Bare
}

pub fn detect<R: DockerRunner + ?Sized>(
    workspace: &Workspace,
    cfg: &Config,
    facts: &HostFacts,
    runner: &R,
) -> Result<EnvironmentProfile> {
    if !workspace.config_path.is_file() {
        return Err(DevstackError::Detection {
            marker: CONFIG_FILE_NAME.to_string(),
            start: workspace.root.clone(),
        });
    }
    let kind = classify(facts);
    let container_id = match kind {
        EnvKind::Container => facts.var("HOSTNAME").map(str::to_string),
        _ => None,
    };
    let physical_host_path = match &container_id {
        Some(id) => resolve_host_path(runner, id, &cfg.workspace.host_path_label)
            .filter(|host| host != &workspace.root),
        None => None,
    };
    let fqdn = match facts.fqdn.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            warn!(
                fallback = FQDN_FALLBACK,
                "could not determine the host FQDN; using fallback domain"
            );
            FQDN_FALLBACK.to_string()
        }
    };
    let profile = EnvironmentProfile {
        kind,
        user_id: facts.user_id,
        group_id: facts.group_id,
        workspace_path: workspace.root.clone(),
        physical_host_path,
        network_group_id: facts.docker_socket_gid.unwrap_or(facts.group_id),
        container_id,
        fqdn,
    };
    info!(
        kind = %profile.kind,
        workspace = %profile.workspace_path.display(),
        host_workspace = %profile.host_workspace_path().display(),
        "environment detected"
    );
    Ok(profile)
}

fn resolve_host_path<R: DockerRunner + ?Sized>(
    runner: &R,
    container_id: &str,
    label: &str,
) -> Option<PathBuf> {
    let format = format!("{{{{ index .Config.Labels \"{label}\" }}}}");
    let args = docker_args(&["inspect", "--format", &format, container_id]);
    match probe_docker(runner, &args) {
        Ok(out) if out.success() => {
            let value = out.stdout_text();
            if value.is_empty() || value == "<no value>" {
                debug!(container_id, label, "container has no host path label");
                None
            } else {
                Some(PathBuf::from(value))
            }
        }
        Ok(out) => {
            warn!(
                container_id,
                stderr = %out.stderr_text(),
                "could not inspect the current container; assuming no bind-mount indirection"
            );
            None
        }
        Err(err) => {
            warn!(error = %err, "container runtime unavailable; assuming no bind-mount indirection");
            None
        }
    }
}

pub fn publish(profile: &EnvironmentProfile, path: &Path) -> Result<()> {
    write_env_file(path, &profile.to_env_map())?;
    debug!(path = %path.display(), "published environment");
    Ok(())
}

pub fn load_profile(path: &Path) -> Result<EnvironmentProfile> {
    if !path.exists() {
        return Err(DevstackError::Config(format!(
            "no published environment at {}; run `devstack env detect` first",
            path.display()
        )));
    }
    EnvironmentProfile::from_env_map(&read_env_file(path)?)
}

fn docker_socket_path(vars: &BTreeMap<String, String>) -> Option<PathBuf> {
    match vars.get("DOCKER_HOST") {
        Some(host) => host.strip_prefix("unix://").map(PathBuf::from),
        None => Some(PathBuf::from(DEFAULT_DOCKER_SOCKET)),
    }
}

#[cfg(unix)]
fn file_gid(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|meta| meta.gid())
}

#[cfg(not(unix))]
fn file_gid(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
pub fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(unix)]
pub fn current_gid() -> u32 {
    // SAFETY: getgid has no preconditions and cannot fail.
    unsafe { libc::getgid() }
}

#[cfg(not(unix))]
pub fn current_uid() -> u32 {
    0
}

#[cfg(not(unix))]
pub fn current_gid() -> u32 {
    0
}

fn host_fqdn() -> Option<String> {
    let output = Command::new("hostname").arg("-f").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::testing::MockDockerRunner;
    use std::fs;
    use tempfile::tempdir;

    fn facts(vars: &[(&str, &str)], container_marker: bool) -> HostFacts {
        HostFacts {
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            container_marker,
            user_id: 1000,
            group_id: 1000,
            docker_socket_gid: Some(998),
            fqdn: Some("dev.example.test".to_string()),
        }
    }

    fn workspace(dir: &Path) -> (Workspace, Config) {
        let cfg = Config::default();
        fs::write(dir.join(CONFIG_FILE_NAME), "version: 1\n").unwrap();
        let ws = Workspace::from_config_path(&dir.join(CONFIG_FILE_NAME), &cfg).unwrap();
        (ws, cfg)
    }

    #[test]
    fn ci_markers_win_over_container_markers() {
        let f = facts(&[("GITHUB_ACTIONS", "true"), ("REMOTE_CONTAINERS", "true")], true);
        assert_eq!(classify(&f), EnvKind::Ci);
    }

    #[test]
    fn container_needs_marker_file_and_platform_var() {
        assert_eq!(classify(&facts(&[("REMOTE_CONTAINERS", "true")], true)), EnvKind::Container);
        assert_eq!(classify(&facts(&[("REMOTE_CONTAINERS", "true")], false)), EnvKind::Bare);
        assert_eq!(classify(&facts(&[], true)), EnvKind::Bare);
    }

    #[test]
    fn ci_false_is_not_ci() {
        assert_eq!(classify(&facts(&[("CI", "false")], false)), EnvKind::Bare);
    }

    #[test]
    fn container_host_path_comes_from_label() {
        let dir = tempdir().unwrap();
        let (ws, cfg) = workspace(dir.path());
        let runner = MockDockerRunner::default();
        runner.push_stdout("/home/dev/src/app\n");
        let f = facts(&[("REMOTE_CONTAINERS", "true"), ("HOSTNAME", "3f2a9c1b7d0e")], true);

        let profile = detect(&ws, &cfg, &f, &runner).unwrap();

        assert_eq!(profile.kind, EnvKind::Container);
        assert_eq!(profile.container_id.as_deref(), Some("3f2a9c1b7d0e"));
        assert_eq!(
            profile.physical_host_path,
            Some(PathBuf::from("/home/dev/src/app"))
        );
        assert_eq!(profile.network_group_id, 998);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[0], "inspect");
        assert!(calls[0].args[2].contains("devcontainer.local_folder"));
        assert_eq!(calls[0].args[3], "3f2a9c1b7d0e");
        assert_eq!(profile.to_env_map()["DEVSTACK_HOST_WORKSPACE"], "/home/dev/src/app");
    }

    #[test]
    fn missing_label_means_no_indirection() {
        let dir = tempdir().unwrap();
        let (ws, cfg) = workspace(dir.path());
        let runner = MockDockerRunner::default();
        runner.push_stdout("<no value>\n");
        let f = facts(&[("CODESPACES", "true"), ("HOSTNAME", "abc")], true);

        let profile = detect(&ws, &cfg, &f, &runner).unwrap();

        assert_eq!(profile.physical_host_path, None);
        assert_eq!(profile.host_workspace_path(), ws.root.as_path());
    }

    #[test]
    fn bare_host_never_calls_docker() {
        let dir = tempdir().unwrap();
        let (ws, cfg) = workspace(dir.path());
        let runner = MockDockerRunner::default();
        let profile = detect(&ws, &cfg, &facts(&[], false), &runner).unwrap();
        assert_eq!(profile.kind, EnvKind::Bare);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn fqdn_failure_falls_back_to_localhost() {
        let dir = tempdir().unwrap();
        let (ws, cfg) = workspace(dir.path());
        let mut f = facts(&[], false);
        f.fqdn = None;
        let profile = detect(&ws, &cfg, &f, &MockDockerRunner::default()).unwrap();
        assert_eq!(profile.fqdn, FQDN_FALLBACK);
    }

    #[test]
    fn missing_marker_fails_detection() {
        let dir = tempdir().unwrap();
        let cfg = Config::default();
        let ws = Workspace::from_config_path(&dir.path().join(CONFIG_FILE_NAME), &cfg).unwrap();
        let err = detect(&ws, &cfg, &facts(&[], false), &MockDockerRunner::default())
            .expect_err("no marker");
        assert!(matches!(err, DevstackError::Detection { .. }));
    }

    #[test]
    fn published_profile_loads_back_identically() {
        let dir = tempdir().unwrap();
        let (ws, cfg) = workspace(dir.path());
        let runner = MockDockerRunner::default();
        runner.push_stdout("/host/app");
        let f = facts(&[("REMOTE_CONTAINERS", "1"), ("HOSTNAME", "c0ffee")], true);
        let profile = detect(&ws, &cfg, &f, &runner).unwrap();

        publish(&profile, &ws.env_file()).unwrap();
        let loaded = load_profile(&ws.env_file()).unwrap();

        assert_eq!(loaded, profile);
        let text = fs::read_to_string(ws.env_file()).unwrap();
        assert!(text.contains("DEVSTACK_ENV_KIND='container'\n"));
        assert!(text.contains("DEVSTACK_HOST_WORKSPACE='/host/app'\n"));
    }
}

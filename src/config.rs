use crate::error::{DevstackError, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "devstack.yaml";
pub const CONFIG_ENV: &str = "DEVSTACK_CONFIG";
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const DEFAULT_PROXY_TEMPLATE: &str = include_str!("../config/proxy.conf.template");

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub workspace: WorkspaceConfig,
    pub network: NetworkConfig,
    pub backend: BackendConfig,
    pub proxy: ProxyConfig,
    pub harness: HarnessConfig,
    pub test: TestConfig,
    pub wait: WaitConfig,
    pub stager: StagerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub state_dir: String,
    pub host_path_label: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub command: Vec<String>,
    pub bind_host: String,
    pub port: u16,
    pub health_path: String,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub startup_attempts: u32,
    pub startup_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub template: String,
    pub output_file: String,
    pub cert_dir: String,
    pub cert_file: String,
    pub key_file: String,
    pub domain: String,
    pub upstream_host: String,
    pub variables: BTreeMap<String, String>,
    pub image: String,
    pub container_name: String,
    pub https_port: u16,
    pub container_port: u16,
    pub config_mount: String,
    pub cert_mount: String,
    pub health_path: String,
    pub stage_root: String,
    pub allowed_stage_roots: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub image: String,
    pub container_name: String,
    pub port: u16,
    pub health_path: String,
    pub shm_size: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct TestConfig {
    pub command: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct WaitConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct StagerConfig {
    pub helper_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: 1,
            workspace: WorkspaceConfig::default(),
            network: NetworkConfig::default(),
            backend: BackendConfig::default(),
            proxy: ProxyConfig::default(),
            harness: HarnessConfig::default(),
            test: TestConfig::default(),
            wait: WaitConfig::default(),
            stager: StagerConfig::default(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig {
            state_dir: ".devstack".to_string(),
            host_path_label: "devcontainer.local_folder".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            name: "devnet".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            command: [
                "python3", "-m", "flask", "run", "--host", "{host}", "--port", "{port}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            bind_host: "0.0.0.0".to_string(),
            port: 5100,
            health_path: "/health".to_string(),
            working_dir: ".".to_string(),
            env: BTreeMap::new(),
            startup_attempts: 30,
            startup_delay_ms: 500,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            template: "config/proxy.conf.template".to_string(),
            output_file: "proxy.conf".to_string(),
            cert_dir: "certs".to_string(),
            cert_file: "cert.pem".to_string(),
            key_file: "key.pem".to_string(),
            domain: String::new(),
            upstream_host: String::new(),
            variables: BTreeMap::new(),
            image: "nginx:1.27-alpine".to_string(),
            container_name: "devstack-proxy".to_string(),
            https_port: 8443,
            container_port: 443,
            config_mount: "/etc/nginx/conf.d".to_string(),
            cert_mount: "/etc/nginx/certs".to_string(),
            health_path: "/health".to_string(),
            stage_root: "/tmp/devstack-stage".to_string(),
            allowed_stage_roots: vec!["/tmp".to_string()],
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            image: "selenium/standalone-chromium:latest".to_string(),
            container_name: "devstack-harness".to_string(),
            port: 4444,
            health_path: "/status".to_string(),
            shm_size: "2g".to_string(),
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            command: vec!["pytest".to_string(), "tests/e2e".to_string()],
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        WaitConfig {
            attempts: 60,
            delay_ms: 1000,
        }
    }
}

impl Default for StagerConfig {
    fn default() -> Self {
        StagerConfig {
            helper_image: "alpine:3.20".to_string(),
        }
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(DevstackError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|err| {
        DevstackError::Config(format!("failed to read {}: {}", path.display(), err))
    })?;
    read_config_from_str(&content)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.workspace.state_dir.trim().is_empty() {
        return Err(DevstackError::Config(
            "workspace.state_dir must be non-empty".to_string(),
        ));
    }
    if cfg.network.name.trim().is_empty() {
        return Err(DevstackError::Config(
            "network.name must be non-empty".to_string(),
        ));
    }
    if cfg.backend.command.is_empty() || cfg.backend.command[0].trim().is_empty() {
        return Err(DevstackError::Config(
            "backend.command must name an executable".to_string(),
        ));
    }
    for (key, port) in [
        ("backend.port", cfg.backend.port),
        ("proxy.https_port", cfg.proxy.https_port),
        ("proxy.container_port", cfg.proxy.container_port),
        ("harness.port", cfg.harness.port),
    ] {
        if port == 0 {
            return Err(DevstackError::Config(format!(
                "{key} must be greater than 0"
            )));
        }
    }
    if cfg.backend.startup_attempts == 0 {
        return Err(DevstackError::Config(
            "backend.startup_attempts must be greater than 0".to_string(),
        ));
    }
    if cfg.wait.attempts == 0 {
        return Err(DevstackError::Config(
            "wait.attempts must be greater than 0".to_string(),
        ));
    }
    for (key, path) in [
        ("backend.health_path", &cfg.backend.health_path),
        ("proxy.health_path", &cfg.proxy.health_path),
        ("harness.health_path", &cfg.harness.health_path),
    ] {
        if !path.starts_with('/') {
            return Err(DevstackError::Config(format!(
                "{key} must start with '/'"
            )));
        }
    }
    for (key, name) in [
        ("proxy.container_name", &cfg.proxy.container_name),
        ("harness.container_name", &cfg.harness.container_name),
        ("proxy.image", &cfg.proxy.image),
        ("harness.image", &cfg.harness.image),
        ("stager.helper_image", &cfg.stager.helper_image),
    ] {
        if name.trim().is_empty() {
            return Err(DevstackError::Config(format!("{key} must be non-empty")));
        }
    }
    if cfg.proxy.allowed_stage_roots.is_empty() {
        return Err(DevstackError::Config(
            "proxy.allowed_stage_roots must contain at least one directory".to_string(),
        ));
    }
    for root in &cfg.proxy.allowed_stage_roots {
        let expanded = PathBuf::from(expand_path(root));
        if !expanded.is_absolute() || normalize_lexically(&expanded) == Path::new("/") {
            return Err(DevstackError::Config(format!(
                "proxy.allowed_stage_roots entry '{root}' must be an absolute directory other than /"
            )));
        }
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn path_is_within(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

// Locates `devstack.yaml`: explicit flag, then `DEVSTACK_CONFIG`, then the
// nearest ancestor of `start` that contains one.
pub fn resolve_config_path(override_path: Option<&PathBuf>, start: &Path) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    find_workspace_marker(start).ok_or_else(|| DevstackError::Detection {
        marker: CONFIG_FILE_NAME.to_string(),
        start: start.to_path_buf(),
    })
}

pub fn find_workspace_marker(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
}

impl Workspace {
    pub fn from_config_path(config_path: &Path, cfg: &Config) -> Result<Self> {
        let absolute = if config_path.is_absolute() {
            config_path.to_path_buf()
        } else {
            env::current_dir()?.join(config_path)
        };
        let root = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let state_dir = root.join(expand_path(&cfg.workspace.state_dir));
        Ok(Workspace {
            root,
            config_path: absolute,
            state_dir,
        })
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        let expanded = PathBuf::from(expand_path(relative));
        if expanded.is_absolute() {
            expanded
        } else {
            self.root.join(expanded)
        }
    }

    pub fn env_file(&self) -> PathBuf {
        self.state_dir.join("environment.env")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("backend.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("backend.log")
    }

    pub fn render_dir(&self) -> PathBuf {
        self.state_dir.join("proxy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn embedded_default_config_is_valid() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("default config");
        assert_eq!(cfg.network.name, "devnet");
        assert_eq!(cfg.backend.port, 5100);
        assert_eq!(cfg.backend.command[0], "python3");
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.workspace.state_dir, ".devstack");
        assert_eq!(cfg.proxy.allowed_stage_roots, vec!["/tmp".to_string()]);
        assert_eq!(cfg.wait.attempts, 60);
    }

    #[test]
    fn config_unknown_field_errors() {
        let result = read_config_from_str("version: 1\nbogus: true\n");
        assert!(matches!(result, Err(DevstackError::Yaml(_))));
    }

    #[test]
    fn config_rejects_wrong_version() {
        let err = read_config_from_str("version: 7").expect_err("version");
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn config_rejects_zero_port() {
        let err = read_config_from_str("version: 1\nbackend:\n  port: 0\n").expect_err("port");
        assert!(err.to_string().contains("backend.port must be greater than 0"));
    }

    #[test]
    fn config_rejects_root_as_stage_root() {
        let yaml = "version: 1\nproxy:\n  allowed_stage_roots: [\"/\"]\n";
        let err = read_config_from_str(yaml).expect_err("stage root");
        assert!(err.to_string().contains("allowed_stage_roots"));
    }

    #[test]
    fn marker_is_found_in_ancestor() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "version: 1\n").unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        let found = find_workspace_marker(&nested).expect("marker");
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn missing_marker_is_detection_error() {
        let dir = tempdir().unwrap();
        let err = resolve_config_path(None, dir.path());
        // DEVSTACK_CONFIG may be set by the caller's shell; only assert when it is not.
        if env::var(CONFIG_ENV).is_err() {
            assert!(matches!(err, Err(DevstackError::Detection { .. })));
        }
    }

    #[test]
    fn lexical_normalization_collapses_parent_components() {
        assert_eq!(
            normalize_lexically(Path::new("/tmp/stage/../../etc")),
            PathBuf::from("/etc")
        );
        assert_eq!(
            normalize_lexically(Path::new("/tmp/./stage/conf")),
            PathBuf::from("/tmp/stage/conf")
        );
    }

    #[test]
    fn workspace_paths_hang_off_state_dir() {
        let cfg = Config::default();
        let ws = Workspace::from_config_path(Path::new("/work/app/devstack.yaml"), &cfg).unwrap();
        assert_eq!(ws.root, PathBuf::from("/work/app"));
        assert_eq!(ws.pid_file(), PathBuf::from("/work/app/.devstack/backend.pid"));
        assert_eq!(ws.resolve("certs"), PathBuf::from("/work/app/certs"));
        assert_eq!(ws.resolve("/etc/certs"), PathBuf::from("/etc/certs"));
    }
}

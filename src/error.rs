use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

impl ErrorDetails {
    pub fn code(error_code: &str) -> Self {
        ErrorDetails {
            error_code: error_code.to_string(),
            hint: None,
            command: None,
            raw_stderr: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum DevstackError {
    #[error("config error: {0}")]
    Config(String),
    #[error("workspace root not found: no {marker} in {} or any parent directory", start.display())]
    Detection { marker: String, start: PathBuf },
    #[error("network '{network}': {message}")]
    Network {
        network: String,
        message: String,
        details: Option<ErrorDetails>,
    },
    #[error("template {} has unresolved placeholders: {}", template.display(), names.join(", "))]
    MissingVariable { template: PathBuf, names: Vec<String> },
    #[error("port {port} already bound by PID {pid}: {command}")]
    PortConflict { port: u16, pid: u32, command: String },
    #[error("backend already running with PID {pid} on port {port}")]
    AlreadyRunning { pid: u32, port: u16 },
    #[error("backend is not running")]
    AlreadyStopped,
    #[error("backend PID {pid} exited during startup ({status}); last lines of {}:\n{tail}", log_path.display())]
    Startup {
        pid: u32,
        status: String,
        log_path: PathBuf,
        tail: String,
    },
    #[error("{what} did not become ready after {attempts} attempts: {check}")]
    HealthCheckTimeout {
        what: String,
        check: String,
        attempts: u32,
    },
    #[error(
        "refusing to stage into {}: not inside an allowed staging root ({allowed}); pass --force to override",
        path.display()
    )]
    UnsafeStageDestination { path: PathBuf, allowed: String },
    #[error("test command `{command}` exited with status {code}")]
    TestFailed { command: String, code: i32 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ErrorDetails,
    },
}

impl DevstackError {
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            DevstackError::AlreadyRunning { .. } | DevstackError::AlreadyStopped
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            DevstackError::AlreadyRunning { .. } | DevstackError::AlreadyStopped => 0,
            DevstackError::Config(_) | DevstackError::Yaml(_) => 2,
            DevstackError::Detection { .. } => 3,
            DevstackError::Network { .. } => 4,
            DevstackError::MissingVariable { .. } => 5,
            DevstackError::PortConflict { .. } => 6,
            DevstackError::Startup { .. } => 7,
            DevstackError::HealthCheckTimeout { .. } => 8,
            DevstackError::UnsafeStageDestination { .. } => 9,
            DevstackError::TestFailed { code, .. } if *code > 0 => *code,
            _ => 1,
        }
    }

    pub fn details(&self) -> Option<ErrorDetails> {
        match self {
            DevstackError::ProcessDetailed { details, .. } => Some(details.clone()),
            DevstackError::Network { details, .. } => details.clone(),
            DevstackError::Detection { marker, .. } => Some(
                ErrorDetails::code("workspace_not_found").with_hint(format!(
                    "Run from inside a workspace containing {marker}, or create one with `devstack config init`."
                )),
            ),
            DevstackError::MissingVariable { .. } => Some(
                ErrorDetails::code("missing_variable")
                    .with_hint("Add the names under proxy.variables or pass --var name=value."),
            ),
            DevstackError::PortConflict { pid, .. } => Some(
                ErrorDetails::code("port_conflict").with_hint(format!(
                    "Stop PID {pid} or start the backend on another port with --port."
                )),
            ),
            DevstackError::Startup { .. } => Some(
                ErrorDetails::code("startup_failed")
                    .with_hint("Inspect the backend log with `devstack backend logs`."),
            ),
            DevstackError::HealthCheckTimeout { .. } => {
                Some(ErrorDetails::code("health_check_timeout"))
            }
            DevstackError::UnsafeStageDestination { .. } => {
                Some(ErrorDetails::code("unsafe_stage_destination"))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DevstackError>;

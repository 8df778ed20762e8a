use crate::config::{BackendConfig, Workspace};
use crate::error::{DevstackError, Result};
use crate::files::{tail_lines, write_atomic_text_file};
use crate::health::HealthProbe;
use crate::poll::{wait_until, PollPolicy};
use crate::process::{read_pid_file, spawn_detached, ProcessHost};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Child;
use tracing::{debug, info, warn};

const STARTUP_LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedProcess {
    pub pid: u32,
    pub bound_port: u16,
    pub log_path: PathBuf,
    pub pid_file_path: PathBuf,
    pub health_check_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: u16,
    pub listening: bool,
    pub log_path: PathBuf,
    pub pid_file: PathBuf,
    pub health_check_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub pid: u32,
    pub resolved_via: &'static str,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub argv: Vec<String>,
    pub port: u16,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub health_check_url: String,
    pub startup: PollPolicy,
    pub stop: PollPolicy,
}

impl SupervisorSettings {
    pub fn from_config(
        backend: &BackendConfig,
        workspace: &Workspace,
        port_override: Option<u16>,
        working_dir_override: Option<&Path>,
    ) -> Self {
        let port = port_override.unwrap_or(backend.port);
        let argv = backend
            .command
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{host}", &backend.bind_host)
            })
            .collect();
        let working_dir = match working_dir_override {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => workspace.root.join(dir),
            None => workspace.resolve(&backend.working_dir),
        };
        let mut env = backend.env.clone();
        env.insert("PORT".to_string(), port.to_string());
        let health_host = match backend.bind_host.as_str() {
            "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
            v6 if v6.contains(':') && !v6.starts_with('[') => format!("[{v6}]"),
            other => other.to_string(),
        };
        SupervisorSettings {
            argv,
            port,
            working_dir,
            env,
            pid_file: workspace.pid_file(),
            log_file: workspace.log_file(),
            health_check_url: format!("http://{health_host}:{port}{}", backend.health_path),
            startup: PollPolicy::new(backend.startup_attempts, backend.startup_delay_ms),
            stop: PollPolicy::new(50, 100),
        }
    }
}

pub struct Supervisor<'a, H: ProcessHost + ?Sized, P: HealthProbe + ?Sized> {
    settings: SupervisorSettings,
    host: &'a H,
    probe: &'a P,
}

impl<'a, H: ProcessHost + ?Sized, P: HealthProbe + ?Sized> Supervisor<'a, H, P> {
    pub fn new(settings: SupervisorSettings, host: &'a H, probe: &'a P) -> Self {
        Supervisor {
            settings,
            host,
            probe,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn transition(&self, from: ProcessState, to: ProcessState, pid: Option<u32>) {
        info!(%from, %to, pid, port = self.settings.port, "backend state");
    }

    // A recorded PID is ours only while it is alive and holds the port. PIDs
    // get reused after a reboot or wrap, so liveness alone proves nothing.
    fn owns_port(&self, pid: u32) -> bool {
        if !self.host.is_alive(pid) {
            return false;
        }
        match self.host.listener_pids(self.settings.port) {
            Ok(pids) => pids.contains(&pid),
            Err(err) => {
                debug!(error = %err, pid, "listener lookup unavailable; matching the command line");
                self.command_matches(pid)
            }
        }
    }

    fn command_matches(&self, pid: u32) -> bool {
        let Some(program) = self.settings.argv.first() else {
            return false;
        };
        let name = Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| program.clone());
        self.host
            .command_line(pid)
            .is_some_and(|command| command.contains(&name))
    }

    fn owned_recorded_pid(&self) -> Option<u32> {
        let pid = read_pid_file(&self.settings.pid_file)?;
        if self.owns_port(pid) {
            return Some(pid);
        }
        if self.host.is_alive(pid) {
            warn!(
                pid,
                port = self.settings.port,
                "recorded PID is alive but does not own the port; treating the record as stale"
            );
        }
        None
    }

    fn remove_pid_file(&self) -> Result<()> {
        match fs::remove_file(&self.settings.pid_file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn start(&self) -> Result<ManagedProcess> {
        let port = self.settings.port;
        if let Some(pid) = self.owned_recorded_pid() {
            return Err(DevstackError::AlreadyRunning { pid, port });
        }
        // Collision guard runs before any PID file housekeeping.
        if let Some(&other) = self.host.listener_pids(port)?.first() {
            return Err(DevstackError::PortConflict {
                port,
                pid: other,
                command: self
                    .host
                    .command_line(other)
                    .unwrap_or_else(|| "<unknown command>".to_string()),
            });
        }
        if self.host.port_in_use(port) {
            return Err(DevstackError::PortConflict {
                port,
                pid: 0,
                command: "<owner not visible to this user>".to_string(),
            });
        }
        if let Some(stale) = read_pid_file(&self.settings.pid_file) {
            warn!(pid = stale, "removing stale PID file");
        }
        self.remove_pid_file()?;

        self.transition(ProcessState::Stopped, ProcessState::Starting, None);
        let mut child = spawn_detached(
            &self.settings.argv,
            &self.settings.working_dir,
            &self.settings.env,
            &self.settings.log_file,
        )?;
        let pid = child.id();
        debug!(pid, argv = ?self.settings.argv, "backend spawned");

        let ready = write_atomic_text_file(&self.settings.pid_file, &format!("{pid}\n"), Some(0o644))
            .and_then(|()| self.await_ready(&mut child, pid));
        match ready {
            Ok(()) => {
                self.transition(ProcessState::Starting, ProcessState::Running, Some(pid));
                Ok(ManagedProcess {
                    pid,
                    bound_port: port,
                    log_path: self.settings.log_file.clone(),
                    pid_file_path: self.settings.pid_file.clone(),
                    health_check_url: self.settings.health_check_url.clone(),
                })
            }
            Err(err) => {
                if let Ok(None) = child.try_wait() {
                    let _ = self.host.terminate(pid);
                    let _ = child.wait();
                }
                let _ = self.remove_pid_file();
                self.transition(ProcessState::Starting, ProcessState::Stopped, Some(pid));
                Err(err)
            }
        }
    }

    // Two bounded barriers: the spawned PID owns the port, then the health
    // endpoint answers. The child exiting at any point aborts both.
    fn await_ready(&self, child: &mut Child, pid: u32) -> Result<()> {
        let port = self.settings.port;
        let policy = &self.settings.startup;

        let bound = wait_until(policy, |attempt| {
            self.ensure_child_running(child, pid)?;
            let listeners = self.host.listener_pids(port)?;
            debug!(attempt, ?listeners, "waiting for backend to bind");
            Ok(listeners.contains(&pid).then_some(()))
        })?;
        if bound.is_none() {
            return Err(DevstackError::HealthCheckTimeout {
                what: "backend".to_string(),
                check: format!("PID {pid} listening on port {port}"),
                attempts: policy.attempts,
            });
        }

        let url = &self.settings.health_check_url;
        let healthy = wait_until(policy, |attempt| {
            self.ensure_child_running(child, pid)?;
            debug!(attempt, url = %url, "backend health probe");
            Ok(self.probe.check(url).then_some(()))
        })?;
        if healthy.is_none() {
            return Err(DevstackError::HealthCheckTimeout {
                what: "backend".to_string(),
                check: format!("GET {url}"),
                attempts: policy.attempts,
            });
        }
        Ok(())
    }

    fn ensure_child_running(&self, child: &mut Child, pid: u32) -> Result<()> {
        match child.try_wait()? {
            None => Ok(()),
            Some(status) => Err(DevstackError::Startup {
                pid,
                status: status.to_string(),
                log_path: self.settings.log_file.clone(),
                tail: tail_lines(&self.settings.log_file, STARTUP_LOG_TAIL_LINES)
                    .map(|lines| lines.join("\n"))
                    .unwrap_or_default(),
            }),
        }
    }

    pub fn stop(&self) -> Result<StopReport> {
        let recorded = read_pid_file(&self.settings.pid_file);
        let target = match self.owned_recorded_pid() {
            Some(pid) => Some((pid, "pid_file")),
            None => {
                if let Some(pid) = recorded {
                    warn!(pid, "PID file is stale; looking for a listener on the port");
                }
                match self.host.listener_pids(self.settings.port) {
                    Ok(pids) => pids.first().map(|pid| (*pid, "port")),
                    Err(err) => {
                        warn!(error = %err, "cannot inspect port listeners");
                        None
                    }
                }
            }
        };
        let Some((pid, resolved_via)) = target else {
            self.remove_pid_file()?;
            return Err(DevstackError::AlreadyStopped);
        };
        if resolved_via == "port" {
            warn!(pid, port = self.settings.port, "stopping unrecorded listener");
        }

        self.transition(ProcessState::Running, ProcessState::Stopping, Some(pid));
        self.host.terminate(pid)?;
        let gone = wait_until(&self.settings.stop, |_| Ok((!self.host.is_alive(pid)).then_some(())))?;
        if gone.is_none() {
            return Err(DevstackError::Process(format!(
                "backend PID {pid} is still alive after SIGKILL"
            )));
        }
        self.remove_pid_file()?;
        self.transition(ProcessState::Stopping, ProcessState::Stopped, Some(pid));
        Ok(StopReport { pid, resolved_via })
    }

    pub fn restart(&self) -> Result<ManagedProcess> {
        match self.stop() {
            Ok(_) | Err(DevstackError::AlreadyStopped) => {}
            Err(err) => return Err(err),
        }
        self.start()
    }

    // read-only: never touches the PID file
    pub fn status(&self) -> StatusReport {
        let recorded = read_pid_file(&self.settings.pid_file);
        let (state, listening) = match recorded {
            Some(pid) if self.owns_port(pid) => {
                let listening = self
                    .host
                    .listener_pids(self.settings.port)
                    .map(|pids| pids.contains(&pid))
                    .unwrap_or(false);
                (ProcessState::Running, listening)
            }
            Some(_) => (ProcessState::Crashed, false),
            None => (ProcessState::Stopped, false),
        };
        StatusReport {
            state,
            pid: recorded,
            port: self.settings.port,
            listening,
            log_path: self.settings.log_file.clone(),
            pid_file: self.settings.pid_file.clone(),
            health_check_url: self.settings.health_check_url.clone(),
        }
    }

    pub fn logs(&self, lines: usize) -> Result<Vec<String>> {
        if !self.settings.log_file.exists() {
            return Err(DevstackError::Process(format!(
                "no backend log at {}; start the backend first",
                self.settings.log_file.display()
            )));
        }
        tail_lines(&self.settings.log_file, lines)
    }
}

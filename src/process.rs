use crate::error::{DevstackError, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use tracing::debug;

pub trait ProcessHost {
    fn is_alive(&self, pid: u32) -> bool;
    fn listener_pids(&self, port: u16) -> Result<Vec<u32>>;
    // Whether something listens on `port`, even if its owner is invisible
    // to this user.
    fn port_in_use(&self, port: u16) -> bool;
    fn command_line(&self, pid: u32) -> Option<String>;
    /// Forced termination; a process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> Result<()>;
}

pub struct SystemHost;

impl ProcessHost for SystemHost {
    fn is_alive(&self, pid: u32) -> bool {
        process_is_alive(pid)
    }

    fn listener_pids(&self, port: u16) -> Result<Vec<u32>> {
        if which::which("lsof").is_ok() {
            return lsof_listeners(port);
        }
        if which::which("ss").is_ok() {
            return ss_listeners(port);
        }
        Err(DevstackError::Process(
            "neither lsof nor ss is available to inspect port listeners".to_string(),
        ))
    }

    fn port_in_use(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_err()
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        if let Ok(raw) = fs::read(format!("/proc/{pid}/cmdline")) {
            let text = raw
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).to_string())
                .collect::<Vec<_>>()
                .join(" ");
            if !text.is_empty() {
                return Some(text);
            }
        }
        let output = Command::new("ps")
            .args(["-o", "command=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !text.is_empty()).then_some(text)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        terminate_process(pid)
    }
}

#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    reap_if_child(pid);
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    let alive = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    alive && !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn process_is_alive(_pid: u32) -> bool {
    false
}

// Collects the exit status if `pid` is an exited child of this process, so
// it does not linger as a zombie. No-op for anything else.
#[cfg(unix)]
fn reap_if_child(pid: u32) {
    let mut status: libc::c_int = 0;
    // SAFETY: WNOHANG never blocks; ECHILD for non-children is ignored.
    unsafe {
        libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG);
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state field follows the parenthesised command name.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z" || state == "X")
        .unwrap_or(false)
}

#[cfg(unix)]
fn terminate_process(pid: u32) -> Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(DevstackError::Process(format!("refusing to signal PID {pid}")));
    }
    let target = pid as libc::pid_t;
    // SAFETY: getpgid only reads process metadata.
    let pgid = unsafe { libc::getpgid(target) };
    // Backends are spawned as group leaders; kill the whole group so
    // reloader children do not keep the port.
    let signal_target = if pgid == target { -target } else { target };
    // SAFETY: plain signal delivery to a validated pid.
    let rc = unsafe { libc::kill(signal_target, libc::SIGKILL) };
    if rc == 0 {
        debug!(pid, group = pgid == target, "sent SIGKILL");
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::ESRCH => Ok(()),
        Some(code) if code == libc::EPERM => Err(DevstackError::Process(format!(
            "not permitted to signal PID {pid}; it belongs to another user"
        ))),
        _ => Err(DevstackError::Process(format!(
            "failed to signal PID {pid}: {err}"
        ))),
    }
}

#[cfg(not(unix))]
fn terminate_process(pid: u32) -> Result<()> {
    Err(DevstackError::Process(format!(
        "process termination of PID {pid} is only supported on unix hosts"
    )))
}

fn lsof_listeners(port: u16) -> Result<Vec<u32>> {
    let output = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .map_err(|err| DevstackError::Process(format!("failed to run lsof: {err}")))?;
    // lsof exits 1 when nothing matches.
    Ok(parse_pid_lines(&String::from_utf8_lossy(&output.stdout)))
}

fn ss_listeners(port: u16) -> Result<Vec<u32>> {
    let output = Command::new("ss")
        .args(["-Hltnp", "sport", "=", &format!(":{port}")])
        .output()
        .map_err(|err| DevstackError::Process(format!("failed to run ss: {err}")))?;
    if !output.status.success() {
        return Err(DevstackError::Process(format!(
            "ss failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(parse_ss_pids(&String::from_utf8_lossy(&output.stdout)))
}

pub fn parse_pid_lines(text: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = text
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

pub fn parse_ss_pids(text: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for chunk in text.split("pid=").skip(1) {
        let digits: String = chunk.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(pid) = digits.parse::<u32>() {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids.dedup();
    pids
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

pub fn spawn_detached(
    argv: &[String],
    cwd: &Path,
    envs: &BTreeMap<String, String>,
    log_path: &Path,
) -> Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| DevstackError::Config("backend.command is empty".to_string()))?;
    crate::files::ensure_parent(log_path)?;
    let log = OpenOptions::new().create(true).append(true).open(log_path)?;
    let log_err = log.try_clone()?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn().map_err(|err| {
        DevstackError::Process(format!(
            "failed to spawn `{}` in {}: {}",
            argv.join(" "),
            cwd.display(),
            err
        ))
    })
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;

    // Pretends whatever the PID file names owns the port, unless a foreign
    // listener has been injected or that PID is marked silent. Liveness and
    // signals are real.
    pub struct PidFileHost {
        pub pid_file: PathBuf,
        pub foreign: RefCell<Vec<u32>>,
        pub silent: Cell<Option<u32>>,
    }

    impl PidFileHost {
        pub fn new(pid_file: PathBuf) -> Self {
            PidFileHost {
                pid_file,
                foreign: RefCell::new(Vec::new()),
                silent: Cell::new(None),
            }
        }
    }

    impl ProcessHost for PidFileHost {
        fn is_alive(&self, pid: u32) -> bool {
            process_is_alive(pid)
        }

        fn listener_pids(&self, _port: u16) -> Result<Vec<u32>> {
            let foreign = self.foreign.borrow();
            if !foreign.is_empty() {
                return Ok(foreign.clone());
            }
            let silent = self.silent.get();
            Ok(read_pid_file(&self.pid_file)
                .filter(|pid| Some(*pid) != silent)
                .into_iter()
                .collect())
        }

        fn port_in_use(&self, _port: u16) -> bool {
            !self.foreign.borrow().is_empty()
        }

        fn command_line(&self, _pid: u32) -> Option<String> {
            Some("python3 -m http.server 5100".to_string())
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            terminate_process(pid)
        }
    }
}

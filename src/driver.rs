use crate::config::{Config, Workspace};
use crate::detect::{EnvKind, EnvironmentProfile};
use crate::docker::{docker_args, execute_docker, probe_docker, DockerRunner};
use crate::error::{DevstackError, Result};
use crate::health::{wait_for_http, HealthProbe};
use crate::network;
use crate::poll::PollPolicy;
use crate::process::ProcessHost;
use crate::render::{render_proxy_config, HOST_GATEWAY_ALIAS};
use crate::stage::{stage_proxy_assets, staged_cert_dir, staged_conf_dir};
use crate::supervisor::{Supervisor, SupervisorSettings};
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Command;
use tracing::{error, info, warn};

const WEBDRIVER_CONTAINER_PORT: u16 = 4444;

type Cleanup<'s> = Box<dyn FnOnce() -> Result<()> + 's>;

/// Started resources, released in reverse order. Dropping an unfinished
/// stack unwinds it, so a panic mid-run still tears down.
pub struct TeardownStack<'s> {
    entries: Vec<(String, Cleanup<'s>)>,
    keep_running: bool,
}

impl<'s> TeardownStack<'s> {
    pub fn new(keep_running: bool) -> Self {
        TeardownStack {
            entries: Vec::new(),
            keep_running,
        }
    }

    pub fn push(&mut self, label: impl Into<String>, cleanup: impl FnOnce() -> Result<()> + 's) {
        self.entries.push((label.into(), Box::new(cleanup)));
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|(label, _)| label.clone()).collect()
    }

    // Runs every cleanup, newest first. Failures are logged and reported
    // but never stop the remaining cleanups.
    pub fn finish(&mut self) -> Vec<String> {
        if self.keep_running {
            if !self.entries.is_empty() {
                warn!(resources = ?self.labels(), "keep-running set; leaving resources up");
            }
            self.entries.clear();
            return Vec::new();
        }
        let mut released = Vec::new();
        while let Some((label, cleanup)) = self.entries.pop() {
            match cleanup() {
                Ok(()) => {
                    info!(resource = %label, "torn down");
                    released.push(label);
                }
                Err(err) if err.is_benign() => {
                    info!(resource = %label, "already gone");
                    released.push(label);
                }
                Err(err) => {
                    error!(resource = %label, error = %err, "teardown failed");
                    released.push(format!("{label} (failed: {err})"));
                }
            }
        }
        released
    }
}

impl Drop for TeardownStack<'_> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            self.finish();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub keep_running: bool,
    pub test_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepReport {
    pub step: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    pub test_exit_code: Option<i32>,
    pub teardown: Vec<String>,
    pub kept_running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub proxy_health: String,
    pub harness_health: String,
    // The application as the harness browser sees it.
    pub base_url: String,
    pub webdriver_url: String,
}

impl Endpoints {
    pub fn for_profile(cfg: &Config, profile: &EnvironmentProfile) -> Self {
        let proxy = &cfg.proxy;
        let harness = &cfg.harness;
        let (proxy_origin, webdriver_url) = match profile.kind {
            EnvKind::Container => (
                format!("https://{}:{}", proxy.container_name, proxy.container_port),
                format!("http://{}:{}", harness.container_name, WEBDRIVER_CONTAINER_PORT),
            ),
            EnvKind::Ci | EnvKind::Bare => (
                format!("https://127.0.0.1:{}", proxy.https_port),
                format!("http://127.0.0.1:{}", harness.port),
            ),
        };
        Endpoints {
            proxy_health: format!("{proxy_origin}{}", proxy.health_path),
            harness_health: format!("{webdriver_url}{}", harness.health_path),
            base_url: format!("https://{}:{}", proxy.container_name, proxy.container_port),
            webdriver_url,
        }
    }
}

pub struct Driver<'a, R: ?Sized, H: ?Sized, P: ?Sized> {
    pub cfg: &'a Config,
    pub workspace: &'a Workspace,
    pub profile: &'a EnvironmentProfile,
    pub runner: &'a R,
    pub host: &'a H,
    pub probe: &'a P,
}

impl<'a, R, H, P> Driver<'a, R, H, P>
where
    R: DockerRunner + ?Sized,
    H: ProcessHost + ?Sized,
    P: HealthProbe + ?Sized,
{
    pub fn run(&self, opts: &RunOptions) -> Result<RunReport> {
        let supervisor = Supervisor::new(
            SupervisorSettings::from_config(&self.cfg.backend, self.workspace, None, None),
            self.host,
            self.probe,
        );
        let mut stack = TeardownStack::new(opts.keep_running);
        let mut steps = Vec::new();

        let outcome = self.forward(&supervisor, &mut stack, &mut steps, opts);
        let kept_running = opts.keep_running && !stack.labels().is_empty();
        let teardown = stack.finish();

        match outcome {
            Ok(code) => Ok(RunReport {
                steps,
                test_exit_code: Some(code),
                teardown,
                kept_running,
            }),
            Err(err) => {
                error!(error = %err, completed = steps.len(), "validation run aborted");
                Err(err)
            }
        }
    }

    fn forward<'s>(
        &'s self,
        supervisor: &'s Supervisor<'a, H, P>,
        stack: &mut TeardownStack<'s>,
        steps: &mut Vec<StepReport>,
        opts: &RunOptions,
    ) -> Result<i32> {
        let cfg = self.cfg;
        let wait = PollPolicy::new(cfg.wait.attempts, cfg.wait.delay_ms);
        let endpoints = Endpoints::for_profile(cfg, self.profile);

        let member = match self.profile.kind {
            EnvKind::Container => self.profile.container_id.as_deref(),
            EnvKind::Ci | EnvKind::Bare => None,
        };
        let net = network::ensure(self.runner, &cfg.network.name, member)?;
        steps.push(step(
            "network",
            format!("{} (created: {}, attached: {})", net.name, net.created, net.attached),
        ));

        let rendered = render_proxy_config(cfg, self.workspace, self.profile, &BTreeMap::new())?;
        steps.push(step("render", rendered.output_path.display().to_string()));

        let staged = stage_proxy_assets(self.runner, cfg, self.workspace, self.profile, false)?;
        let staged_files: usize = staged.iter().map(|asset| asset.files.len()).sum();
        steps.push(step("stage", format!("{staged_files} files")));

        match supervisor.start() {
            Ok(process) => {
                stack.push("backend", move || supervisor.stop().map(|_| ()));
                steps.push(step("backend", format!("PID {} on port {}", process.pid, process.bound_port)));
            }
            Err(DevstackError::AlreadyRunning { pid, port }) => {
                // Not ours to tear down; only confirm it still answers.
                info!(pid, port, "reusing running backend");
                let url = &supervisor.settings().health_check_url;
                wait_for_http(self.probe, "backend", url, &wait)?;
                steps.push(step("backend", format!("reused PID {pid} on port {port}")));
            }
            Err(err) => return Err(err),
        }

        self.start_container(stack, &cfg.proxy.container_name, self.proxy_run_args())?;
        wait_for_http(self.probe, "proxy", &endpoints.proxy_health, &wait)?;
        steps.push(step("proxy", endpoints.proxy_health.clone()));

        self.start_container(stack, &cfg.harness.container_name, self.harness_run_args())?;
        wait_for_http(self.probe, "harness", &endpoints.harness_health, &wait)?;
        steps.push(step("harness", endpoints.harness_health.clone()));

        let code = self.run_tests(opts, &endpoints)?;
        steps.push(step("test", format!("exit status {code}")));
        Ok(code)
    }

    fn start_container<'s>(
        &'s self,
        stack: &mut TeardownStack<'s>,
        name: &str,
        run_args: Vec<String>,
    ) -> Result<()> {
        remove_container(self.runner, name)?;
        let runner = self.runner;
        let owned = name.to_string();
        stack.push(name, move || remove_container(runner, &owned));
        execute_docker(self.runner, &run_args, None)?;
        info!(container = name, "container started");
        Ok(())
    }

    pub fn proxy_run_args(&self) -> Vec<String> {
        let proxy = &self.cfg.proxy;
        let publish = format!("{}:{}", proxy.https_port, proxy.container_port);
        let conf = format!("{}:{}:ro", staged_conf_dir(self.cfg).display(), proxy.config_mount);
        let certs = format!("{}:{}:ro", staged_cert_dir(self.cfg).display(), proxy.cert_mount);
        let mut args = docker_args(&[
            "run",
            "-d",
            "--name",
            &proxy.container_name,
            "--network",
            &self.cfg.network.name,
            "-p",
            &publish,
            "-v",
            &conf,
            "-v",
            &certs,
        ]);
        if self.profile.kind != EnvKind::Container {
            args.push("--add-host".to_string());
            args.push(format!("{HOST_GATEWAY_ALIAS}:host-gateway"));
        }
        args.push(proxy.image.clone());
        args
    }

    pub fn harness_run_args(&self) -> Vec<String> {
        let harness = &self.cfg.harness;
        let publish = format!("{}:{}", harness.port, WEBDRIVER_CONTAINER_PORT);
        docker_args(&[
            "run",
            "-d",
            "--name",
            &harness.container_name,
            "--network",
            &self.cfg.network.name,
            "-p",
            &publish,
            "--shm-size",
            &harness.shm_size,
            &harness.image,
        ])
    }

    fn run_tests(&self, opts: &RunOptions, endpoints: &Endpoints) -> Result<i32> {
        let argv = if opts.test_command.is_empty() {
            &self.cfg.test.command
        } else {
            &opts.test_command
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DevstackError::Config("test.command is empty".to_string()))?;
        info!(command = %argv.join(" "), "running tests");
        let status = Command::new(program)
            .args(args)
            .current_dir(&self.workspace.root)
            .envs(self.profile.to_env_map())
            .env("DEVSTACK_BASE_URL", &endpoints.base_url)
            .env("DEVSTACK_WEBDRIVER_URL", &endpoints.webdriver_url)
            .status()
            .map_err(|err| {
                DevstackError::Process(format!("failed to run `{}`: {err}", argv.join(" ")))
            })?;
        // Killed by a signal: report like a shell would.
        let code = status.code().unwrap_or(128);
        if code == 0 {
            info!("tests passed");
        } else {
            warn!(code, "tests failed");
        }
        Ok(code)
    }
}

fn step(step: &'static str, detail: String) -> StepReport {
    StepReport { step, detail }
}

pub fn remove_container<R: DockerRunner + ?Sized>(runner: &R, name: &str) -> Result<()> {
    let args = docker_args(&["rm", "-f", name]);
    let out = probe_docker(runner, &args)?;
    if out.success() || out.stderr_text().to_lowercase().contains("no such container") {
        return Ok(());
    }
    execute_docker(runner, &args, None).map(|_| ())
}

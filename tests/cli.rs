use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const SCRUBBED_VARS: &[&str] = &[
    "DEVSTACK_CONFIG",
    "DEVSTACK_LOG",
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
    "CIRCLECI",
    "REMOTE_CONTAINERS",
    "CODESPACES",
    "DEVCONTAINER",
    "container",
];

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("devstack");
    let mut cmd = Command::new(path);
    for key in SCRUBBED_VARS {
        cmd.env_remove(key);
    }
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn init_workspace(root: &Path) {
    bin()
        .arg("--workspace")
        .arg(root)
        .arg("config")
        .arg("init")
        .assert()
        .success();
}

/// A config whose backend port is unlikely to collide with anything real.
fn write_config(root: &Path, extra: &str) {
    fs::write(
        root.join("devstack.yaml"),
        format!("version: 1\nbackend:\n  port: 47913\n{extra}"),
    )
    .unwrap();
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();

    let output = bin()
        .arg("--json")
        .arg("--workspace")
        .arg(dir.path())
        .arg("config")
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"]["created"], true);
    assert_eq!(json["result"]["template_created"], true);
    assert!(dir.path().join("devstack.yaml").exists());
    assert!(dir.path().join("config/proxy.conf.template").exists());

    fs::write(dir.path().join("devstack.yaml"), "version: 1\nnetwork:\n  name: mine\n").unwrap();
    let output = bin()
        .arg("--json")
        .arg("--workspace")
        .arg(dir.path())
        .arg("config")
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["created"], false);
    let text = fs::read_to_string(dir.path().join("devstack.yaml")).unwrap();
    assert!(text.contains("name: mine"));
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("devstack.yaml"), "version: 1\nbogus: true\n").unwrap();

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("config")
        .arg("validate")
        .assert()
        .code(2)
        .stderr(contains("unknown field"));
}

#[test]
fn config_validate_accepts_defaults() {
    let dir = tempdir().unwrap();
    init_workspace(dir.path());

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("config")
        .arg("validate")
        .assert()
        .success()
        .stdout(contains("is valid"));
}

#[test]
fn outside_a_workspace_is_a_detection_error() {
    let dir = tempdir().unwrap();

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("backend")
        .arg("status")
        .assert()
        .code(3)
        .stderr(contains("workspace root not found"))
        .stderr(contains("devstack config init"));
}

#[test]
fn nested_directory_finds_the_workspace_root() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "");
    let nested = dir.path().join("src").join("app");
    fs::create_dir_all(&nested).unwrap();

    let output = bin()
        .arg("--json")
        .arg("--workspace")
        .arg(&nested)
        .arg("config")
        .arg("validate")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(
        json["result"]["path"],
        dir.path().join("devstack.yaml").display().to_string()
    );
}

#[test]
fn env_detect_publishes_and_show_reads_back() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "");

    let output = bin()
        .arg("--json")
        .arg("--workspace")
        .arg(dir.path())
        .arg("env")
        .arg("detect")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["profile"]["kind"], "bare");
    let env_file = dir.path().join(".devstack").join("environment.env");
    assert!(env_file.exists());

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("env")
        .arg("show")
        .assert()
        .success()
        .stdout(contains("DEVSTACK_ENV_KIND=bare"))
        .stdout(contains(format!("DEVSTACK_WORKSPACE={}", dir.path().display())));
}

#[test]
fn env_show_without_detection_explains_what_to_run() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "");

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("env")
        .arg("show")
        .assert()
        .code(2)
        .stderr(contains("devstack env detect"));
}

#[test]
fn backend_status_reports_stopped() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "");

    let output = bin()
        .arg("--json")
        .arg("--workspace")
        .arg(dir.path())
        .arg("backend")
        .arg("status")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"]["state"], "stopped");
    assert_eq!(json["result"]["port"], 47913);
    assert_eq!(json["result"]["listening"], false);
}

#[test]
fn backend_stop_when_not_running_is_success() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "");

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("backend")
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("backend is not running"));
}

#[test]
fn backend_logs_before_first_start_fails() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "");

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("backend")
        .arg("logs")
        .assert()
        .failure()
        .stderr(contains("no backend log"));
}

#[test]
fn proxy_render_substitutes_and_reports_unchanged_on_rerun() {
    let dir = tempdir().unwrap();
    init_workspace(dir.path());

    let run = || {
        bin()
            .arg("--json")
            .arg("--workspace")
            .arg(dir.path())
            .arg("proxy")
            .arg("render")
            .arg("--var")
            .arg("domain=app.test")
            .output()
            .unwrap()
    };

    let first = run();
    assert!(first.status.success());
    assert_eq!(parse_json(&first.stdout)["result"]["changed"], true);
    let rendered = dir.path().join(".devstack").join("proxy").join("proxy.conf");
    let text = fs::read_to_string(&rendered).unwrap();
    assert!(text.contains("server_name app.test;"));
    assert!(!text.contains("{{"));

    let second = run();
    assert!(second.status.success());
    assert_eq!(parse_json(&second.stdout)["result"]["changed"], false);
    assert_eq!(fs::read_to_string(&rendered).unwrap(), text);
}

#[test]
fn proxy_render_fails_fast_on_missing_variable() {
    let dir = tempdir().unwrap();
    init_workspace(dir.path());
    let template = dir.path().join("config").join("proxy.conf.template");
    fs::write(&template, "server_name {{ domain }};\nallow {{ office_cidr }};\n").unwrap();

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("proxy")
        .arg("render")
        .assert()
        .code(5)
        .stderr(contains("office_cidr"));
    assert!(!dir.path().join(".devstack/proxy/proxy.conf").exists());
}

#[test]
fn proxy_stage_refuses_destination_outside_allow_list() {
    let dir = tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let outside = dir.path().join("outside");
    fs::create_dir_all(&scratch).unwrap();
    fs::create_dir_all(outside.join("stage").join("conf")).unwrap();
    fs::write(outside.join("stage").join("conf").join("keep.txt"), "keep").unwrap();
    let ws = dir.path().join("ws");
    fs::create_dir_all(ws.join("certs")).unwrap();
    init_workspace(&ws);
    write_config(
        &ws,
        &format!(
            "proxy:\n  stage_root: {}\n  allowed_stage_roots: [\"{}\"]\n",
            outside.join("stage").display(),
            scratch.display()
        ),
    );
    bin()
        .arg("--workspace")
        .arg(&ws)
        .arg("proxy")
        .arg("render")
        .assert()
        .success();

    bin()
        .arg("--workspace")
        .arg(&ws)
        .arg("proxy")
        .arg("stage")
        .assert()
        .code(9)
        .stderr(contains("refusing to stage"));
    assert!(outside.join("stage").join("conf").join("keep.txt").exists());
}

#[test]
fn proxy_stage_replaces_destination_inside_allow_list() {
    let dir = tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let stage_root = scratch.join("stage");
    fs::create_dir_all(stage_root.join("conf")).unwrap();
    fs::write(stage_root.join("conf").join("stale.conf"), "old").unwrap();
    let ws = dir.path().join("ws");
    fs::create_dir_all(ws.join("certs")).unwrap();
    fs::write(ws.join("certs").join("cert.pem"), "cert").unwrap();
    init_workspace(&ws);
    write_config(
        &ws,
        &format!(
            "proxy:\n  stage_root: {}\n  allowed_stage_roots: [\"{}\"]\n",
            stage_root.display(),
            scratch.display()
        ),
    );
    bin()
        .arg("--workspace")
        .arg(&ws)
        .arg("proxy")
        .arg("render")
        .assert()
        .success();

    let output = bin()
        .arg("--json")
        .arg("--workspace")
        .arg(&ws)
        .arg("proxy")
        .arg("stage")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["result"][0]["mode"], "direct");
    assert_eq!(json["result"][0]["files"][0], "proxy.conf");
    assert!(stage_root.join("conf").join("proxy.conf").exists());
    assert!(!stage_root.join("conf").join("stale.conf").exists());
    assert!(stage_root.join("certs").join("cert.pem").exists());
}

#[test]
fn network_ensure_without_docker_reports_details() {
    let dir = tempdir().unwrap();
    write_config(dir.path(), "");

    let output = bin()
        .env("PATH", "")
        .arg("--json")
        .arg("--workspace")
        .arg(dir.path())
        .arg("network")
        .arg("ensure")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_details"]["error_code"], "docker_not_found");
    assert!(json["error"].as_str().unwrap().contains("devnet"));
}

#[test]
fn unsupported_config_version_is_config_error() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("devstack.yaml"), "version: 3\n").unwrap();

    bin()
        .arg("--workspace")
        .arg(dir.path())
        .arg("validate")
        .assert()
        .code(2)
        .stderr(contains("unsupported config version 3"));
}

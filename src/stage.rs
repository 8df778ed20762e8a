use crate::config::{expand_path, normalize_lexically, path_is_within, Config, Workspace};
use crate::detect::{EnvKind, EnvironmentProfile};
use crate::docker::{docker_args, execute_docker, DockerRunner};
use crate::error::{DevstackError, Result};
use crate::files::shell_quote;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

const HELPER_MOUNT: &str = "/devstack-stage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageMode {
    Direct,
    // The destination only exists for the container runtime; stream a tar
    // of the source through a throwaway helper container.
    Runtime {
        helper_image: String,
        owner: Option<(u32, u32)>,
    },
}

#[derive(Debug, Clone)]
pub struct StagePolicy {
    pub allowed_roots: Vec<PathBuf>,
    // Skip the allow-list; `/` is still refused.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedAsset {
    pub source_directory: PathBuf,
    pub destination_directory: PathBuf,
    pub staged_at: DateTime<Utc>,
    pub mode: &'static str,
    pub files: Vec<String>,
}

fn comparable_forms(path: &Path) -> Vec<PathBuf> {
    let lexical = normalize_lexically(path);
    let mut forms = vec![lexical.clone()];
    if let Ok(canonical) = fs::canonicalize(&lexical) {
        forms.push(canonical);
    } else if let (Some(parent), Some(name)) = (lexical.parent(), lexical.file_name()) {
        if let Ok(parent) = fs::canonicalize(parent) {
            forms.push(parent.join(name));
        }
    }
    forms
}

pub fn validate_destination(dest: &Path, policy: &StagePolicy) -> Result<PathBuf> {
    let normalized = normalize_lexically(dest);
    let allowed = policy
        .allowed_roots
        .iter()
        .map(|root| root.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let refuse = || DevstackError::UnsafeStageDestination {
        path: dest.to_path_buf(),
        allowed: allowed.clone(),
    };
    if !normalized.is_absolute() || normalized.parent().is_none() {
        return Err(refuse());
    }
    if policy.force {
        warn!(destination = %normalized.display(), "staging allow-list overridden");
        return Ok(normalized);
    }
    let dest_forms = comparable_forms(&normalized);
    let inside = policy.allowed_roots.iter().any(|root| {
        comparable_forms(root).iter().any(|root_form| {
            dest_forms
                .iter()
                .any(|dest_form| dest_form != root_form && path_is_within(dest_form, root_form))
        })
    });
    if inside {
        Ok(normalized)
    } else {
        Err(refuse())
    }
}

pub fn stage<R: DockerRunner + ?Sized>(
    runner: &R,
    source: &Path,
    dest: &Path,
    mode: &StageMode,
    policy: &StagePolicy,
) -> Result<StagedAsset> {
    if !source.is_dir() {
        return Err(DevstackError::Config(format!(
            "staging source {} is not a directory",
            source.display()
        )));
    }
    let dest = validate_destination(dest, policy)?;
    if let Ok(source_canonical) = fs::canonicalize(source) {
        if comparable_forms(&dest)
            .iter()
            .any(|form| path_is_within(&source_canonical, form))
        {
            return Err(DevstackError::Config(format!(
                "staging destination {} contains the source {}",
                dest.display(),
                source.display()
            )));
        }
    }
    let files = list_files(source)?;

    let mode_name = match mode {
        StageMode::Direct => {
            replace_directory(source, &dest)?;
            "direct"
        }
        StageMode::Runtime {
            helper_image,
            owner,
        } => {
            stage_through_runtime(runner, source, &dest, helper_image, *owner)?;
            "runtime"
        }
    };
    info!(
        source = %source.display(),
        destination = %dest.display(),
        files = files.len(),
        mode = mode_name,
        "staged assets"
    );
    Ok(StagedAsset {
        source_directory: source.to_path_buf(),
        destination_directory: dest,
        staged_at: Utc::now(),
        mode: mode_name,
        files,
    })
}

fn replace_directory(source: &Path, dest: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(dest) {
        if meta.is_dir() {
            fs::remove_dir_all(dest)?;
        } else {
            fs::remove_file(dest)?;
        }
    }
    fs::create_dir_all(dest)?;
    copy_tree(source, dest)
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        // follow symlinks: certificate directories are often link farms
        if fs::metadata(&from)?.is_dir() {
            fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

pub fn list_files(root: &Path) -> Result<Vec<String>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if fs::metadata(&path)?.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().to_string());
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

fn tar_directory(source: &Path) -> Result<Vec<u8>> {
    let output = Command::new("tar")
        .arg("-C")
        .arg(source)
        .arg("-chf")
        .arg("-")
        .arg(".")
        .output()
        .map_err(|err| DevstackError::Process(format!("failed to run tar: {err}")))?;
    if !output.status.success() {
        return Err(DevstackError::Process(format!(
            "tar of {} failed with status {}: {}",
            source.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

pub fn helper_script(name: &str, owner: Option<(u32, u32)>) -> String {
    let target = shell_quote(&format!("{HELPER_MOUNT}/{name}"));
    let mut script = format!("rm -rf {target} && mkdir -p {target} && tar -xf - -C {target}");
    if let Some((uid, gid)) = owner {
        script.push_str(&format!(" && chown -R {uid}:{gid} {target}"));
    }
    script
}

fn stage_through_runtime<R: DockerRunner + ?Sized>(
    runner: &R,
    source: &Path,
    dest: &Path,
    helper_image: &str,
    owner: Option<(u32, u32)>,
) -> Result<()> {
    let (Some(parent), Some(name)) = (dest.parent(), dest.file_name()) else {
        return Err(DevstackError::Config(format!(
            "staging destination {} has no parent directory",
            dest.display()
        )));
    };
    let archive = tar_directory(source)?;
    let volume = format!("{}:{HELPER_MOUNT}", parent.display());
    let script = helper_script(&name.to_string_lossy(), owner);
    let args = docker_args(&[
        "run", "--rm", "-i", "-v", &volume, helper_image, "sh", "-c", &script,
    ]);
    execute_docker(runner, &args, Some(&archive))?;
    Ok(())
}

pub fn mode_for(cfg: &Config, profile: &EnvironmentProfile) -> StageMode {
    match profile.kind {
        EnvKind::Container => StageMode::Runtime {
            helper_image: cfg.stager.helper_image.clone(),
            owner: Some((profile.user_id, profile.group_id)),
        },
        EnvKind::Ci | EnvKind::Bare => StageMode::Direct,
    }
}

pub fn policy_for(cfg: &Config, force: bool) -> StagePolicy {
    StagePolicy {
        allowed_roots: cfg
            .proxy
            .allowed_stage_roots
            .iter()
            .map(|root| PathBuf::from(expand_path(root)))
            .collect(),
        force,
    }
}

pub fn staged_conf_dir(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.proxy.stage_root)).join("conf")
}

pub fn staged_cert_dir(cfg: &Config) -> PathBuf {
    PathBuf::from(expand_path(&cfg.proxy.stage_root)).join("certs")
}

pub fn stage_proxy_assets<R: DockerRunner + ?Sized>(
    runner: &R,
    cfg: &Config,
    workspace: &Workspace,
    profile: &EnvironmentProfile,
    force: bool,
) -> Result<Vec<StagedAsset>> {
    let mode = mode_for(cfg, profile);
    let policy = policy_for(cfg, force);
    let pairs = [
        (workspace.render_dir(), staged_conf_dir(cfg)),
        (workspace.resolve(&cfg.proxy.cert_dir), staged_cert_dir(cfg)),
    ];
    let mut staged = Vec::with_capacity(pairs.len());
    for (source, dest) in &pairs {
        staged.push(stage(runner, source, dest, &mode, &policy)?);
    }
    Ok(staged)
}

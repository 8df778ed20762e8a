use crate::config::{Config, Workspace};
use crate::detect::{EnvKind, EnvironmentProfile};
use crate::error::{DevstackError, Result};
use crate::files::write_atomic_text_file;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";

#[derive(Debug, Clone, Serialize)]
pub struct RenderedConfig {
    pub template_path: PathBuf,
    pub output_path: PathBuf,
    pub substituted_variables: BTreeMap<String, String>,
    pub changed: bool,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    Missing(Vec<String>),
    Malformed(String),
}

// Expands every `{{ name }}` placeholder. Either every placeholder resolves
// or nothing is returned.
pub fn expand(
    template: &str,
    vars: &BTreeMap<String, String>,
) -> std::result::Result<(String, BTreeMap<String, String>), ExpandError> {
    let mut out = String::with_capacity(template.len());
    let mut used = BTreeMap::new();
    let mut missing = BTreeSet::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open
            .find("}}")
            .filter(|close| !after_open[..*close].contains('\n'))
        else {
            let line = rest[open..].lines().next().unwrap_or("{{");
            return Err(ExpandError::Malformed(line.trim_end().to_string()));
        };
        let body = &after_open[..close];
        let name = body.trim();
        if !is_identifier(name) {
            return Err(ExpandError::Malformed(format!("{{{{{body}}}}}")));
        }
        match vars.get(name) {
            Some(value) => {
                out.push_str(value);
                used.insert(name.to_string(), value.clone());
            }
            None => {
                missing.insert(name.to_string());
            }
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);

    if missing.is_empty() {
        Ok((out, used))
    } else {
        Err(ExpandError::Missing(missing.into_iter().collect()))
    }
}

pub fn render(
    template_path: &Path,
    output_path: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<RenderedConfig> {
    let template = fs::read_to_string(template_path).map_err(|err| {
        DevstackError::Config(format!(
            "failed to read proxy template {}: {}",
            template_path.display(),
            err
        ))
    })?;
    let (content, used) = expand(&template, vars).map_err(|err| match err {
        ExpandError::Missing(names) => DevstackError::MissingVariable {
            template: template_path.to_path_buf(),
            names,
        },
        ExpandError::Malformed(text) => DevstackError::Config(format!(
            "template {} has a malformed placeholder `{}`",
            template_path.display(),
            text
        )),
    })?;

    let unchanged = fs::read_to_string(output_path)
        .map(|existing| existing == content)
        .unwrap_or(false);
    if unchanged {
        debug!(output = %output_path.display(), "rendered config unchanged");
    } else {
        write_atomic_text_file(output_path, &content, Some(0o644))?;
        info!(
            template = %template_path.display(),
            output = %output_path.display(),
            "rendered proxy config"
        );
    }

    Ok(RenderedConfig {
        template_path: template_path.to_path_buf(),
        output_path: output_path.to_path_buf(),
        substituted_variables: used,
        changed: !unchanged,
    })
}

pub fn render_proxy_config(
    cfg: &Config,
    workspace: &Workspace,
    profile: &EnvironmentProfile,
    overrides: &BTreeMap<String, String>,
) -> Result<RenderedConfig> {
    let template = workspace.resolve(&cfg.proxy.template);
    let output = workspace.render_dir().join(&cfg.proxy.output_file);
    render(&template, &output, &proxy_variables(cfg, profile, overrides))
}

// Built-in placeholder values, then `proxy.variables`, then CLI overrides.
pub fn proxy_variables(
    cfg: &Config,
    profile: &EnvironmentProfile,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    let domain = if cfg.proxy.domain.trim().is_empty() {
        profile.fqdn.clone()
    } else {
        cfg.proxy.domain.trim().to_string()
    };
    vars.insert("domain".to_string(), domain);
    vars.insert("upstream_host".to_string(), upstream_host(cfg, profile));
    vars.insert("upstream_port".to_string(), cfg.backend.port.to_string());
    let cert_mount = cfg.proxy.cert_mount.trim_end_matches('/');
    vars.insert("cert_dir".to_string(), cert_mount.to_string());
    vars.insert(
        "cert_path".to_string(),
        format!("{}/{}", cert_mount, cfg.proxy.cert_file),
    );
    vars.insert(
        "key_path".to_string(),
        format!("{}/{}", cert_mount, cfg.proxy.key_file),
    );
    for (key, value) in &cfg.proxy.variables {
        vars.insert(key.clone(), value.clone());
    }
    for (key, value) in overrides {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

pub fn upstream_host(cfg: &Config, profile: &EnvironmentProfile) -> String {
    if !cfg.proxy.upstream_host.trim().is_empty() {
        return cfg.proxy.upstream_host.trim().to_string();
    }
    match (&profile.kind, &profile.container_id) {
        (EnvKind::Container, Some(id)) => id.clone(),
        _ => HOST_GATEWAY_ALIAS.to_string(),
    }
}

pub fn parse_var_overrides(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for item in raw {
        let (key, value) = item.split_once('=').ok_or_else(|| {
            DevstackError::Config(format!("--var expects name=value, got '{item}'"))
        })?;
        let key = key.trim();
        if !is_identifier(key) {
            return Err(DevstackError::Config(format!(
                "--var name '{key}' is not a valid placeholder name"
            )));
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

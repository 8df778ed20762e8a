use crate::error::{DevstackError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "devstack".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

// Inverse of `shell_quote`; unquoted values pass through.
fn shell_unquote(raw: &str) -> String {
    if !raw.starts_with('\'') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut quoted = false;
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match (quoted, ch) {
            (_, '\'') => quoted = !quoted,
            (false, '\\') => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            (_, other) => out.push(other),
        }
    }
    out
}

// Written so that `. environment.env` works from sh.
pub fn write_env_file(path: &Path, envs: &BTreeMap<String, String>) -> Result<()> {
    let mut content = String::new();
    for (key, value) in envs {
        if value.contains('\n') {
            return Err(DevstackError::Config(format!(
                "{key} contains a newline and cannot be exported"
            )));
        }
        content.push_str(&format!("{}={}\n", key, shell_quote(value)));
    }
    write_atomic_text_file(path, &content, Some(0o644))
}

pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)?;
    let mut envs = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            envs.insert(key.trim().to_string(), shell_unquote(value));
        }
    }
    Ok(envs)
}

// only the trailing 64 KiB are read
pub fn tail_lines(path: &Path, lines: usize) -> Result<Vec<String>> {
    const MAX_TAIL_BYTES: u64 = 64 * 1024;
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(MAX_TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    let mut all: Vec<&str> = text.lines().collect();
    if start > 0 && !all.is_empty() {
        // first line is probably cut mid-way
        all.remove(0);
    }
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|line| line.to_string()).collect())
}

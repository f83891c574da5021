//! Read-only host facts
//!
//! Everything here goes through the executor's query operations, so it runs
//! unchanged in dry-run mode and against a scripted backend in tests.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use syscmd::Executor;

static NVIDIA_CONTROLLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(VGA compatible|3D|Display) controller.*NVIDIA").expect("valid regex")
});

/// Fields of `/etc/os-release` the tool cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
    pub pretty_name: String,
}

impl OsRelease {
    /// Whether this is the supported release.
    pub fn is_supported(&self) -> bool {
        self.id == "ubuntu" && self.version_id == "22.04"
    }
}

/// Parse `/etc/os-release` content.
pub fn parse_os_release(content: &str) -> OsRelease {
    let mut release = OsRelease::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "ID" => release.id = value,
            "VERSION_ID" => release.version_id = value,
            "PRETTY_NAME" => release.pretty_name = value,
            _ => {}
        }
    }
    release
}

/// Read the OS release.
pub fn os_release(exec: &Executor) -> Result<OsRelease> {
    let content = exec
        .read_to_string(Path::new("/etc/os-release"))?
        .context("/etc/os-release not found")?;
    Ok(parse_os_release(&content))
}

/// Whether the effective user is root.
pub fn is_root(exec: &Executor) -> Result<bool> {
    Ok(exec.probe_stdout("id", &["-u"])? == "0")
}

/// Free bytes on the filesystem holding `path`.
pub fn free_disk_bytes(exec: &Executor, path: &str) -> Result<u64> {
    let output = exec.probe_stdout("df", &["--output=avail", "-B1", path])?;
    output
        .lines()
        .filter_map(|l| l.trim().parse::<u64>().ok())
        .next()
        .with_context(|| format!("unexpected df output: {output}"))
}

/// Whether `host` answers a single ping.
pub fn has_connectivity(exec: &Executor, host: &str) -> bool {
    exec.probe_ok("ping", &["-c", "1", "-W", "5", host])
}

/// NVIDIA display/3D controllers reported by `lspci`.
pub fn nvidia_gpus(exec: &Executor) -> Result<Vec<String>> {
    if !exec.command_exists("lspci") {
        log::warn!("lspci not found; assuming no GPU");
        return Ok(Vec::new());
    }
    let output = exec.probe("lspci", &["-nn"])?;
    Ok(output
        .stdout
        .lines()
        .filter(|l| NVIDIA_CONTROLLER.is_match(l))
        .map(str::to_string)
        .collect())
}

/// Whether an NVIDIA GPU is present.
pub fn has_nvidia_gpu(exec: &Executor) -> Result<bool> {
    Ok(!nvidia_gpus(exec)?.is_empty())
}

/// Invoking user behind sudo, if any.
pub fn sudo_user() -> Option<String> {
    std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty())
}

/// Home directory of a local account.
pub fn home_dir(exec: &Executor, user: &str) -> Result<Option<PathBuf>> {
    let output = exec.probe("getent", &["passwd", user])?;
    if !output.success() {
        return Ok(None);
    }
    Ok(output
        .stdout_trimmed()
        .split(':')
        .nth(5)
        .filter(|h| !h.is_empty())
        .map(PathBuf::from))
}

/// Whether a local account exists.
pub fn user_exists(exec: &Executor, user: &str) -> bool {
    exec.probe_ok("getent", &["passwd", user])
}

/// Whether the account has a non-empty `authorized_keys`.
pub fn has_authorized_keys(exec: &Executor, user: &str) -> Result<bool> {
    let Some(home) = home_dir(exec, user)? else {
        return Ok(false);
    };
    let keys = exec.read_to_string(&home.join(".ssh").join("authorized_keys"))?;
    Ok(keys.is_some_and(|k| k.lines().any(|l| !l.trim().is_empty() && !l.starts_with('#'))))
}

/// Group names of an account.
pub fn groups(exec: &Executor, user: &str) -> Result<Vec<String>> {
    let output = exec.probe_stdout("id", &["-nG", user])?;
    Ok(output.split_whitespace().map(str::to_string).collect())
}

//! Centralized path resolution for gpuhost
//!
//! Every location the tool owns has a fixed system default and an
//! environment variable override, so the tool can be exercised against a
//! scratch tree.
//!
//! # Environment Variables
//!
//! - `GPUHOST_LOG_FILE` - Override the log file (default `/var/log/gpuhost.log`)
//! - `GPUHOST_BACKUP_DIR` - Override the restore point root (default `/var/backups/gpuhost`)
//! - `GPUHOST_STATE_DIR` - Override the run state directory (default `/var/lib/gpuhost`)
//! - `GPUHOST_CONFIG` - Override the default config file (default `/etc/gpuhost/config.toml`)

use std::path::PathBuf;

/// Environment variable for the log file override
pub const ENV_LOG_FILE: &str = "GPUHOST_LOG_FILE";

/// Environment variable for the backup root override
pub const ENV_BACKUP_DIR: &str = "GPUHOST_BACKUP_DIR";

/// Environment variable for the state directory override
pub const ENV_STATE_DIR: &str = "GPUHOST_STATE_DIR";

/// Environment variable for the default config file override
pub const ENV_CONFIG: &str = "GPUHOST_CONFIG";

const DEFAULT_LOG_FILE: &str = "/var/log/gpuhost.log";
const DEFAULT_BACKUP_DIR: &str = "/var/backups/gpuhost";
const DEFAULT_STATE_DIR: &str = "/var/lib/gpuhost";
const DEFAULT_CONFIG: &str = "/etc/gpuhost/config.toml";

fn resolve(var: &str, default: &str) -> PathBuf {
    if let Ok(value) = std::env::var(var)
        && !value.is_empty()
    {
        let path = expand(&value);
        log::debug!("Using {} from {}: {}", default, var, path.display());
        return path;
    }
    PathBuf::from(default)
}

/// Append-only run log
pub fn log_file() -> PathBuf {
    resolve(ENV_LOG_FILE, DEFAULT_LOG_FILE)
}

/// Log file for runs that cannot write the system log (unprivileged dry-run)
pub fn fallback_log_file() -> Option<PathBuf> {
    dirs::state_dir().map(|dir| dir.join("gpuhost").join("gpuhost.log"))
}

/// Root directory of all restore points
pub fn backup_dir() -> PathBuf {
    resolve(ENV_BACKUP_DIR, DEFAULT_BACKUP_DIR)
}

/// Directory holding `state.toml`
pub fn state_dir() -> PathBuf {
    resolve(ENV_STATE_DIR, DEFAULT_STATE_DIR)
}

/// Config file read when `--config` is not given
pub fn config_file() -> PathBuf {
    resolve(ENV_CONFIG, DEFAULT_CONFIG)
}

/// Expand ~ and environment variables in a path string.
///
/// All modules should use this instead of calling shellexpand directly.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

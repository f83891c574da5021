//! Host configuration
//!
//! Sources, later wins: built-in defaults, the config file, `--set KEY=VALUE`,
//! then explicit flags such as `--skip-nvidia`. Config files ending in
//! `.toml` are parsed as TOML; anything else as shell-style `KEY=VALUE`
//! lines with case-insensitive keys.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Kernel parameters written by the kernel-tuning step unless overridden.
pub const DEFAULT_SYSCTL: &[(&str, &str)] = &[
    ("fs.inotify.max_user_watches", "524288"),
    ("net.core.netdev_max_backlog", "16384"),
    ("net.core.rmem_max", "16777216"),
    ("net.core.somaxconn", "65535"),
    ("net.core.wmem_max", "16777216"),
    ("net.ipv4.ip_forward", "1"),
    ("net.ipv4.tcp_max_syn_backlog", "8192"),
    ("vm.max_map_count", "262144"),
    ("vm.swappiness", "10"),
];

static SYSCTL_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+(\.[A-Za-z0-9_\-]+)+$").expect("valid regex"));
static USER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));
static SAFE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"));
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)*$").expect("valid regex"));
static DOCKER_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+[kmg]?$").expect("valid regex"));

// ============================================================================
// Errors
// ============================================================================

/// Errors from loading or overriding configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown config key '{key}' (known: {known})")]
    UnknownKey { key: String, known: String },

    #[error("invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("{}:{line}: expected KEY=VALUE, got '{content}'", path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn invalid(key: impl fmt::Display, value: &str, expected: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

// ============================================================================
// Value types
// ============================================================================

/// sshd `PermitRootLogin` policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootLogin {
    No,
    ProhibitPassword,
    Yes,
}

impl RootLogin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::ProhibitPassword => "prohibit-password",
            Self::Yes => "yes",
        }
    }
}

impl FromStr for RootLogin {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no" => Ok(Self::No),
            "prohibit-password" | "without-password" => Ok(Self::ProhibitPassword),
            "yes" => Ok(Self::Yes),
            _ => Err(()),
        }
    }
}

/// sshd `PasswordAuthentication` policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PasswordAuth {
    /// Leave whatever the system has
    Keep,
    Yes,
    /// Disable, unless the target user has no authorized keys
    No,
}

impl PasswordAuth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl FromStr for PasswordAuth {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            _ => Err(()),
        }
    }
}

// ============================================================================
// HostConfig
// ============================================================================

/// Every tunable of a provisioning run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub nvidia_driver_version: String,
    pub install_nvidia: bool,
    pub install_docker: bool,
    pub fd_limit: u64,
    pub ssh_port: u16,
    pub permit_root_login: RootLogin,
    pub password_authentication: PasswordAuth,
    pub max_auth_tries: u32,
    /// Account added to the docker group (falls back to `SUDO_USER`)
    pub target_user: Option<String>,
    pub min_disk_gb: u64,
    pub connectivity_host: String,
    /// 0 disables the timeout
    pub command_timeout_secs: u64,
    pub docker_storage_driver: String,
    pub docker_log_max_size: String,
    pub docker_log_max_file: u32,
    pub vendor_cli_name: String,
    pub vendor_cli_version: String,
    pub monitor_interval_secs: u64,
    /// Extra or overriding kernel parameters
    pub sysctl: BTreeMap<String, String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            nvidia_driver_version: "535".to_string(),
            install_nvidia: true,
            install_docker: true,
            fd_limit: 1_048_576,
            ssh_port: 22,
            permit_root_login: RootLogin::No,
            password_authentication: PasswordAuth::Keep,
            max_auth_tries: 3,
            target_user: None,
            min_disk_gb: 20,
            connectivity_host: "8.8.8.8".to_string(),
            command_timeout_secs: 1800,
            docker_storage_driver: "overlay2".to_string(),
            docker_log_max_size: "100m".to_string(),
            docker_log_max_file: 3,
            vendor_cli_name: "vendor-cli".to_string(),
            vendor_cli_version: "0.0.0".to_string(),
            monitor_interval_secs: 60,
            sysctl: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    /// Load a config file, choosing the format by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = if path.extension().is_some_and(|e| e == "toml") {
            toml::from_str::<Self>(&content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::from_key_values(path, &content)?
        };
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse shell-style `KEY=VALUE` lines over the defaults.
    pub fn from_key_values(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax {
                    path: path.to_path_buf(),
                    line: index + 1,
                    content: raw.to_string(),
                });
            };
            let key: OverrideKey = key.trim().parse()?;
            config.set(&key, unquote(value.trim()))?;
        }
        Ok(config)
    }

    /// Apply `--set KEY=VALUE` pairs. Returns the parsed pairs.
    pub fn apply_overrides(&mut self, pairs: &[String]) -> Result<Vec<(OverrideKey, String)>, ConfigError> {
        let mut applied = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(invalid("--set", pair, "KEY=VALUE"));
            };
            let key: OverrideKey = key.trim().parse()?;
            let value = unquote(value.trim());
            self.set(&key, value)?;
            applied.push((key, value.to_string()));
        }
        self.validate()?;
        Ok(applied)
    }

    /// Set a single key from its string form.
    pub fn set(&mut self, key: &OverrideKey, value: &str) -> Result<(), ConfigError> {
        fn parse<T: FromStr>(key: &OverrideKey, value: &str, expected: &str) -> Result<T, ConfigError> {
            value.parse().map_err(|_| invalid(key, value, expected))
        }

        match key {
            OverrideKey::NvidiaDriverVersion => self.nvidia_driver_version = value.to_string(),
            OverrideKey::InstallNvidia => self.install_nvidia = parse_bool(key, value)?,
            OverrideKey::InstallDocker => self.install_docker = parse_bool(key, value)?,
            OverrideKey::FdLimit => self.fd_limit = parse(key, value, "a positive integer")?,
            OverrideKey::SshPort => self.ssh_port = parse(key, value, "a port number")?,
            OverrideKey::PermitRootLogin => {
                self.permit_root_login = parse(key, value, "no, prohibit-password or yes")?;
            }
            OverrideKey::PasswordAuthentication => {
                self.password_authentication = parse(key, value, "keep, yes or no")?;
            }
            OverrideKey::MaxAuthTries => self.max_auth_tries = parse(key, value, "an integer")?,
            OverrideKey::TargetUser => {
                self.target_user = (!value.is_empty()).then(|| value.to_string());
            }
            OverrideKey::MinDiskGb => self.min_disk_gb = parse(key, value, "an integer")?,
            OverrideKey::ConnectivityHost => self.connectivity_host = value.to_string(),
            OverrideKey::CommandTimeoutSecs => {
                self.command_timeout_secs = parse(key, value, "seconds")?;
            }
            OverrideKey::DockerStorageDriver => self.docker_storage_driver = value.to_string(),
            OverrideKey::DockerLogMaxSize => self.docker_log_max_size = value.to_string(),
            OverrideKey::DockerLogMaxFile => {
                self.docker_log_max_file = parse(key, value, "an integer")?;
            }
            OverrideKey::VendorCliName => self.vendor_cli_name = value.to_string(),
            OverrideKey::VendorCliVersion => self.vendor_cli_version = value.to_string(),
            OverrideKey::MonitorIntervalSecs => {
                self.monitor_interval_secs = parse(key, value, "seconds")?;
            }
            OverrideKey::Sysctl(name) => {
                self.sysctl.insert(name.clone(), value.to_string());
            }
        }
        Ok(())
    }

    /// Reject values that would produce broken artifacts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VERSION.is_match(&self.nvidia_driver_version) {
            return Err(invalid(
                OverrideKey::NvidiaDriverVersion,
                &self.nvidia_driver_version,
                "a driver branch such as 535",
            ));
        }
        if self.ssh_port == 0 {
            return Err(invalid(OverrideKey::SshPort, "0", "a port number"));
        }
        if self.max_auth_tries == 0 {
            return Err(invalid(OverrideKey::MaxAuthTries, "0", "at least 1"));
        }
        if self.fd_limit < 1024 {
            return Err(invalid(OverrideKey::FdLimit, &self.fd_limit.to_string(), "at least 1024"));
        }
        if self.monitor_interval_secs == 0 {
            return Err(invalid(OverrideKey::MonitorIntervalSecs, "0", "at least 1 second"));
        }
        if let Some(user) = &self.target_user
            && !USER_NAME.is_match(user)
        {
            return Err(invalid(OverrideKey::TargetUser, user, "a login name"));
        }
        for (key, value) in [
            (OverrideKey::VendorCliName, &self.vendor_cli_name),
            (OverrideKey::VendorCliVersion, &self.vendor_cli_version),
            (OverrideKey::DockerStorageDriver, &self.docker_storage_driver),
            (OverrideKey::ConnectivityHost, &self.connectivity_host),
        ] {
            if !SAFE_NAME.is_match(value) {
                return Err(invalid(key, value, "letters, digits, '.', '_' or '-'"));
            }
        }
        if !DOCKER_SIZE.is_match(&self.docker_log_max_size) {
            return Err(invalid(
                OverrideKey::DockerLogMaxSize,
                &self.docker_log_max_size,
                "a size such as 100m",
            ));
        }
        for (key, value) in &self.sysctl {
            if !SYSCTL_KEY.is_match(key) {
                return Err(invalid(format!("sysctl.{key}"), value, "a dotted kernel parameter name"));
            }
            if value.is_empty() || value.contains('\n') {
                return Err(invalid(format!("sysctl.{key}"), value, "a single-line value"));
            }
        }
        Ok(())
    }

    /// Kernel parameters to apply: defaults merged with `[sysctl]`.
    pub fn sysctl_params(&self) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = DEFAULT_SYSCTL
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        params.insert("fs.file-max".to_string(), self.fd_limit.max(2_097_152).to_string());
        params.extend(self.sysctl.clone());
        params
    }

    /// Per-command timeout, `None` when disabled.
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    /// Account to grant docker access: config, then `SUDO_USER`.
    pub fn resolve_target_user(&self, sudo_user: Option<&str>) -> Option<String> {
        self.target_user.clone().or_else(|| {
            sudo_user
                .filter(|u| !u.is_empty() && *u != "root" && USER_NAME.is_match(u))
                .map(str::to_string)
        })
    }

    /// Every scalar key with its effective value, for the run log.
    pub fn effective_values(&self) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        for key in OverrideKey::SCALAR {
            values.insert(key.to_string(), self.get(key));
        }
        for (name, value) in &self.sysctl {
            values.insert(format!("sysctl.{name}"), value.clone());
        }
        values
    }

    fn get(&self, key: &OverrideKey) -> String {
        match key {
            OverrideKey::NvidiaDriverVersion => self.nvidia_driver_version.clone(),
            OverrideKey::InstallNvidia => self.install_nvidia.to_string(),
            OverrideKey::InstallDocker => self.install_docker.to_string(),
            OverrideKey::FdLimit => self.fd_limit.to_string(),
            OverrideKey::SshPort => self.ssh_port.to_string(),
            OverrideKey::PermitRootLogin => self.permit_root_login.as_str().to_string(),
            OverrideKey::PasswordAuthentication => self.password_authentication.as_str().to_string(),
            OverrideKey::MaxAuthTries => self.max_auth_tries.to_string(),
            OverrideKey::TargetUser => self.target_user.clone().unwrap_or_default(),
            OverrideKey::MinDiskGb => self.min_disk_gb.to_string(),
            OverrideKey::ConnectivityHost => self.connectivity_host.clone(),
            OverrideKey::CommandTimeoutSecs => self.command_timeout_secs.to_string(),
            OverrideKey::DockerStorageDriver => self.docker_storage_driver.clone(),
            OverrideKey::DockerLogMaxSize => self.docker_log_max_size.clone(),
            OverrideKey::DockerLogMaxFile => self.docker_log_max_file.to_string(),
            OverrideKey::VendorCliName => self.vendor_cli_name.clone(),
            OverrideKey::VendorCliVersion => self.vendor_cli_version.clone(),
            OverrideKey::MonitorIntervalSecs => self.monitor_interval_secs.to_string(),
            OverrideKey::Sysctl(name) => self.sysctl.get(name).cloned().unwrap_or_default(),
        }
    }
}

/// Load the config: an explicit path must exist; the default path is optional.
pub fn load(explicit: Option<&Path>) -> Result<HostConfig, ConfigError> {
    if let Some(path) = explicit {
        return HostConfig::load(&crate::paths::expand(&path.to_string_lossy()));
    }
    let default = crate::paths::config_file();
    if default.exists() {
        HostConfig::load(&default)
    } else {
        log::debug!("No config file at {}, using defaults", default.display());
        Ok(HostConfig::default())
    }
}

fn parse_bool(key: &OverrideKey, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "true or false")),
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

// ============================================================================
// OverrideKey
// ============================================================================

/// A settable configuration key, validated at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OverrideKey {
    NvidiaDriverVersion,
    InstallNvidia,
    InstallDocker,
    FdLimit,
    SshPort,
    PermitRootLogin,
    PasswordAuthentication,
    MaxAuthTries,
    TargetUser,
    MinDiskGb,
    ConnectivityHost,
    CommandTimeoutSecs,
    DockerStorageDriver,
    DockerLogMaxSize,
    DockerLogMaxFile,
    VendorCliName,
    VendorCliVersion,
    MonitorIntervalSecs,
    /// `sysctl.<parameter>`
    Sysctl(String),
}

impl OverrideKey {
    /// Every key except the open-ended `sysctl.*` family.
    pub const SCALAR: &'static [Self] = &[
        Self::NvidiaDriverVersion,
        Self::InstallNvidia,
        Self::InstallDocker,
        Self::FdLimit,
        Self::SshPort,
        Self::PermitRootLogin,
        Self::PasswordAuthentication,
        Self::MaxAuthTries,
        Self::TargetUser,
        Self::MinDiskGb,
        Self::ConnectivityHost,
        Self::CommandTimeoutSecs,
        Self::DockerStorageDriver,
        Self::DockerLogMaxSize,
        Self::DockerLogMaxFile,
        Self::VendorCliName,
        Self::VendorCliVersion,
        Self::MonitorIntervalSecs,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::NvidiaDriverVersion => "nvidia_driver_version",
            Self::InstallNvidia => "install_nvidia",
            Self::InstallDocker => "install_docker",
            Self::FdLimit => "fd_limit",
            Self::SshPort => "ssh_port",
            Self::PermitRootLogin => "permit_root_login",
            Self::PasswordAuthentication => "password_authentication",
            Self::MaxAuthTries => "max_auth_tries",
            Self::TargetUser => "target_user",
            Self::MinDiskGb => "min_disk_gb",
            Self::ConnectivityHost => "connectivity_host",
            Self::CommandTimeoutSecs => "command_timeout_secs",
            Self::DockerStorageDriver => "docker_storage_driver",
            Self::DockerLogMaxSize => "docker_log_max_size",
            Self::DockerLogMaxFile => "docker_log_max_file",
            Self::VendorCliName => "vendor_cli_name",
            Self::VendorCliVersion => "vendor_cli_version",
            Self::MonitorIntervalSecs => "monitor_interval_secs",
            Self::Sysctl(_) => "sysctl",
        }
    }
}

impl fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sysctl(name) => write!(f, "sysctl.{name}"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for OverrideKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        if let Some(name) = s.trim().strip_prefix("sysctl.").or_else(|| s.trim().strip_prefix("SYSCTL.")) {
            return Ok(Self::Sysctl(name.to_string()));
        }
        Self::SCALAR
            .iter()
            .find(|k| k.name() == normalized)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKey {
                key: s.trim().to_string(),
                known: Self::SCALAR
                    .iter()
                    .map(OverrideKey::name)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

// ============================================================================
// Tests
// ============================================================================

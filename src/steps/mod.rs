//! Provisioning step catalogue
//!
//! Two fixed sequences are built from these steps: `setup` turns a bare
//! Ubuntu 22.04 machine into a GPU container host, `convert` strips a
//! desktop installation down to a headless server. Order encodes
//! dependency; nothing here reorders steps.

mod common;
mod host;
mod server;

pub use common::{Backup, Cleanup, PackageUpdate, SshHardening};
pub use host::{
    Docker, ESSENTIAL_PACKAGES, EnableServices, EssentialPackages, KernelTuning, Nvidia,
    SystemRequirements, VendorCli,
};
pub use server::{
    AutoUpdates, DesktopRemoval, EnableSsh, Firewall, NetworkSwitch, ServerPackages, Utilities,
};

use crate::config::HostConfig;
use clap::ValueEnum;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use stepkit::{RunError, Runner, Step};

/// Every step name a user can refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum StepName {
    SystemRequirements,
    Backup,
    PackageUpdate,
    EssentialPackages,
    Docker,
    Nvidia,
    KernelTuning,
    SshHardening,
    VendorCli,
    Cleanup,
    ServerPackages,
    DesktopRemoval,
    NetworkSwitch,
    Firewall,
    AutoUpdates,
    Utilities,
}

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemRequirements => "system-requirements",
            Self::Backup => "backup",
            Self::PackageUpdate => "package-update",
            Self::EssentialPackages => "essential-packages",
            Self::Docker => "docker",
            Self::Nvidia => "nvidia",
            Self::KernelTuning => "kernel-tuning",
            Self::SshHardening => "ssh-hardening",
            Self::VendorCli => "vendor-cli",
            Self::Cleanup => "cleanup",
            Self::ServerPackages => "server-packages",
            Self::DesktopRemoval => "desktop-removal",
            Self::NetworkSwitch => "network-switch",
            Self::Firewall => "firewall",
            Self::AutoUpdates => "auto-updates",
            Self::Utilities => "utilities",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true).map_err(|_| {
            let known: Vec<&str> = Self::value_variants().iter().map(|v| v.as_str()).collect();
            format!("unknown step '{s}' (known: {})", known.join(", "))
        })
    }
}

/// Which fixed sequence to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    /// GPU container host provisioning
    Setup,
    /// Desktop to headless server conversion
    Convert,
}

impl Sequence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Convert => "convert",
        }
    }
}

/// Errors that stop a run before anything is changed
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error("must run as root (try: sudo gpuhost ...)")]
    NotRoot,

    #[error("unsupported OS '{found}': Ubuntu 22.04 is required")]
    UnsupportedOs { found: String },

    #[error("only {free_gb} GiB free on /, at least {required_gb} GiB required")]
    LowDisk { free_gb: u64, required_gb: u64 },

    #[error("no network connectivity (cannot reach {host})")]
    NoConnectivity { host: String },
}

/// Inputs shared by every step of a run
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: HostConfig,
    /// Account granted docker access, and whose keys guard password auth
    pub target_user: Option<String>,
    pub backup_root: PathBuf,
    /// Non-interactive: prompts that could override a safety check are refused
    pub assume_yes: bool,
}

/// Files captured by the setup restore point.
pub fn host_backup_paths() -> Vec<PathBuf> {
    [
        "/etc/apt/sources.list",
        "/etc/apt/sources.list.d",
        "/etc/docker/daemon.json",
        "/etc/sysctl.conf",
        "/etc/security/limits.conf",
        "/etc/ssh/sshd_config",
        "/etc/systemd/system/gpuhost-monitor.service",
        "/etc/default/grub",
        "/etc/fstab",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

/// Files captured by the convert restore point.
pub fn server_backup_paths() -> Vec<PathBuf> {
    [
        "/etc/apt/sources.list",
        "/etc/apt/apt.conf.d/20auto-upgrades",
        "/etc/ssh/sshd_config",
        "/etc/netplan",
        "/etc/NetworkManager",
        "/etc/ufw",
        "/etc/fstab",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

/// The setup steps in order, followed by the service finalizer.
pub fn host_sequence(settings: &Rc<Settings>) -> Result<Runner, RunError> {
    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(SystemRequirements::new(settings)),
        Box::new(Backup::new(settings, host_backup_paths())),
        Box::new(PackageUpdate),
        Box::new(EssentialPackages),
        Box::new(Docker::new(settings)),
        Box::new(Nvidia::new(settings)),
        Box::new(KernelTuning::new(settings)),
        Box::new(SshHardening::new(settings)),
        Box::new(VendorCli::new(settings)),
        Box::new(Cleanup),
    ];
    Ok(Runner::new(steps)?.with_finalizer(Box::new(EnableServices)))
}

/// The convert steps in order, followed by the ssh finalizer.
pub fn server_sequence(settings: &Rc<Settings>) -> Result<Runner, RunError> {
    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(Backup::new(settings, server_backup_paths())),
        Box::new(PackageUpdate),
        Box::new(ServerPackages),
        Box::new(SshHardening::new(settings)),
        Box::new(DesktopRemoval),
        Box::new(NetworkSwitch),
        Box::new(Firewall::new(settings)),
        Box::new(AutoUpdates),
        Box::new(Cleanup),
        Box::new(Utilities),
    ];
    Ok(Runner::new(steps)?.with_finalizer(Box::new(EnableSsh)))
}

/// Build the runner for a sequence.
pub fn sequence(kind: Sequence, settings: &Rc<Settings>) -> Result<Runner, RunError> {
    match kind {
        Sequence::Setup => host_sequence(settings),
        Sequence::Convert => server_sequence(settings),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use stepkit::{AutoConfirm, CancelFlag, NoObserver, RunConfig, StepContext, StepOutcome};
    use syscmd::Executor;
    use syscmd::backend::scripted::ScriptedBackend;

    pub fn settings() -> Rc<Settings> {
        Rc::new(Settings {
            host: HostConfig::default(),
            target_user: Some("alice".into()),
            backup_root: PathBuf::from("/nonexistent/backups"),
            assume_yes: true,
        })
    }

    /// A host that looks like a fresh Ubuntu 22.04 install.
    pub fn fresh_host() -> ScriptedBackend {
        let backend = ScriptedBackend::new();
        backend
            .with_file("/etc/os-release", "ID=ubuntu\nVERSION_ID=\"22.04\"\nPRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\n")
            .with_file("/etc/ssh/sshd_config", "Include /etc/ssh/sshd_config.d/*.conf\n#Port 22\n")
            .with_file("/etc/sysctl.conf", "# sysctl settings\n")
            .with_file("/etc/security/limits.conf", "# limits\n");
        backend
            .on("id -u", syscmd::CommandOutput::ok("0\n"))
            .on("df", syscmd::CommandOutput::ok("Avail\n107374182400\n"))
            .on("dpkg --print-architecture", syscmd::CommandOutput::ok("amd64\n"))
            .on("systemctl is-active", syscmd::CommandOutput::ok("active\n"));
        backend
    }

    /// Run `f` with a step context over `backend`.
    pub fn with_ctx<R>(backend: &ScriptedBackend, config: RunConfig, f: impl FnOnce(&mut StepContext) -> R) -> R {
        let exec = Executor::new(Box::new(backend.clone())).dry_run(config.dry_run);
        let mut confirm = AutoConfirm;
        let mut ctx = StepContext::new(&config, &exec, &mut confirm);
        f(&mut ctx)
    }

    /// Run a single step through a runner and return its outcome.
    pub fn run_one(step: Box<dyn Step>, backend: &ScriptedBackend, config: RunConfig) -> StepOutcome {
        let runner = Runner::new(vec![step]).unwrap();
        let flag = AtomicBool::new(false);
        let mut summary = with_ctx(backend, config, |ctx| {
            runner.execute(ctx, &mut NoObserver, CancelFlag::new(&flag)).unwrap()
        });
        summary.steps.remove(0).outcome
    }
}

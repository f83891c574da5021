//! GPU container host steps

use super::{PreconditionError, Settings, StepName};
use crate::probe;
use crate::templates::docker::{DAEMON_JSON, DaemonSettings};
use crate::templates::files::{self, LIMITS_CONF, MONITOR_SCRIPT, MONITOR_UNIT, MONITOR_UNIT_PATH, SYSCTL_CONF, block};
use crate::templates::{self, Placement};
use crate::ui;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use stepkit::{ApplyResult, Readiness, Step, StepContext};
use syscmd::Executor;
use syscmd::apt::Apt;
use syscmd::systemd::Systemd;

/// Base tooling every host gets
pub const ESSENTIAL_PACKAGES: &[&str] = &[
    "apt-transport-https",
    "build-essential",
    "ca-certificates",
    "curl",
    "git",
    "gnupg",
    "htop",
    "jq",
    "lsb-release",
    "net-tools",
    "pciutils",
    "software-properties-common",
    "unzip",
    "wget",
];

const DOCKER_PACKAGES: &[&str] = &[
    "docker-ce",
    "docker-ce-cli",
    "containerd.io",
    "docker-buildx-plugin",
    "docker-compose-plugin",
];
const DOCKER_KEY_URL: &str = "https://download.docker.com/linux/ubuntu/gpg";
const DOCKER_KEYRING: &str = "/etc/apt/keyrings/docker.gpg";
const DOCKER_LIST: &str = "/etc/apt/sources.list.d/docker.list";

const NVIDIA_KEY_URL: &str = "https://nvidia.github.io/libnvidia-container/gpgkey";
const NVIDIA_KEYRING: &str = "/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg";
const NVIDIA_LIST: &str = "/etc/apt/sources.list.d/nvidia-container-toolkit.list";
const NVIDIA_TOOLKIT: &str = "nvidia-container-toolkit";

/// An apt repository signed by a dearmored key
struct AptRepo<'a> {
    key_url: &'a str,
    keyring: &'a str,
    list: &'a str,
    source: String,
}

impl AptRepo<'_> {
    fn is_current(&self, exec: &Executor) -> Result<bool> {
        Ok(exec.exists(Path::new(self.keyring))
            && exec.read_to_string(Path::new(self.list))?.as_deref() == Some(self.source.as_str()))
    }

    /// Fetch the key and write the source list. Returns whether anything changed.
    fn ensure(&self, exec: &Executor) -> Result<bool> {
        let mut changed = false;
        let keyring = Path::new(self.keyring);
        if !exec.exists(keyring) {
            if let Some(dir) = keyring.parent() {
                exec.create_dir_all(dir)?;
            }
            let fetch = format!("curl -fsSL {} | gpg --dearmor --yes -o {}", self.key_url, self.keyring);
            exec.run_or_fail("sh", &["-c", &fetch])
                .with_context(|| format!("fetching signing key {}", self.key_url))?;
            changed = true;
        }
        changed |= templates::write_if_changed(exec, Path::new(self.list), &self.source, Some(0o644))?;
        Ok(changed)
    }
}

fn docker_repo(exec: &Executor) -> Result<AptRepo<'static>> {
    let arch = exec.probe_stdout("dpkg", &["--print-architecture"])?;
    Ok(AptRepo {
        key_url: DOCKER_KEY_URL,
        keyring: DOCKER_KEYRING,
        list: DOCKER_LIST,
        source: files::apt_source(&arch, DOCKER_KEYRING, "https://download.docker.com/linux/ubuntu", "jammy", "stable"),
    })
}

fn nvidia_repo() -> AptRepo<'static> {
    AptRepo {
        key_url: NVIDIA_KEY_URL,
        keyring: NVIDIA_KEYRING,
        list: NVIDIA_LIST,
        source: format!(
            "deb [signed-by={NVIDIA_KEYRING}] https://nvidia.github.io/libnvidia-container/stable/deb/$(ARCH) /\n"
        ),
    }
}

fn daemon_settings(settings: &Settings, nvidia: bool) -> DaemonSettings {
    DaemonSettings {
        storage_driver: settings.host.docker_storage_driver.clone(),
        log_max_size: settings.host.docker_log_max_size.clone(),
        log_max_file: settings.host.docker_log_max_file,
        nvidia,
    }
}

/// Current and merged daemon.json content.
fn daemon_json(exec: &Executor, daemon: &DaemonSettings) -> Result<(Option<String>, String)> {
    let existing = exec.read_to_string(Path::new(DAEMON_JSON))?;
    let merged = daemon.merge(existing.as_deref()).with_context(|| format!("merging {DAEMON_JSON}"))?;
    Ok((existing, merged))
}

// ============================================================================
// system-requirements
// ============================================================================

/// Refuse to touch a host that is not root, not Ubuntu 22.04, short on disk or offline
pub struct SystemRequirements {
    settings: Rc<Settings>,
}

impl SystemRequirements {
    pub fn new(settings: &Rc<Settings>) -> Self {
        Self {
            settings: Rc::clone(settings),
        }
    }
}

impl Step for SystemRequirements {
    fn name(&self) -> &'static str {
        StepName::SystemRequirements.as_str()
    }

    fn description(&self) -> String {
        "Check privileges, OS release, disk space and connectivity".to_string()
    }

    fn skippable(&self) -> bool {
        false
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let host = &self.settings.host;

        if !probe::is_root(ctx.exec)? {
            if ctx.is_dry_run() {
                log::warn!("Not running as root; a real run would stop here");
            } else {
                return Err(PreconditionError::NotRoot.into());
            }
        }

        let release = probe::os_release(ctx.exec)?;
        let found = if release.pretty_name.is_empty() {
            format!("{} {}", release.id, release.version_id)
        } else {
            release.pretty_name.clone()
        };
        if !release.is_supported() {
            log::warn!("Detected {found}, expected Ubuntu 22.04");
            let proceed = !self.settings.assume_yes
                && ctx.confirm(&format!("{found} is not Ubuntu 22.04. Continue anyway?"))?;
            if !proceed {
                return Err(PreconditionError::UnsupportedOs { found }.into());
            }
            log::warn!("Continuing on {found} at the operator's request");
        }

        let free = probe::free_disk_bytes(ctx.exec, "/")?;
        if free < ui::gib(host.min_disk_gb) {
            return Err(PreconditionError::LowDisk {
                free_gb: free / ui::gib(1),
                required_gb: host.min_disk_gb,
            }
            .into());
        }

        if !probe::has_connectivity(ctx.exec, &host.connectivity_host) {
            return Err(PreconditionError::NoConnectivity {
                host: host.connectivity_host.clone(),
            }
            .into());
        }

        Ok(ApplyResult::Unchanged(format!(
            "{found}, {} free, {} reachable",
            ui::format_size(free),
            host.connectivity_host
        )))
    }
}

// ============================================================================
// essential-packages
// ============================================================================

/// Install the base tool set
pub struct EssentialPackages;

impl Step for EssentialPackages {
    fn name(&self) -> &'static str {
        StepName::EssentialPackages.as_str()
    }

    fn description(&self) -> String {
        format!("Install {} essential packages", ESSENTIAL_PACKAGES.len())
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        if Apt::new(ctx.exec).missing(ESSENTIAL_PACKAGES)?.is_empty() {
            return Ok(Readiness::AlreadySatisfied(format!(
                "all {} essential packages installed",
                ESSENTIAL_PACKAGES.len()
            )));
        }
        Ok(Readiness::Ready)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let installed = Apt::new(ctx.exec).install(ESSENTIAL_PACKAGES)?;
        Ok(ApplyResult::Changed(format!("installed {}", installed.join(", "))))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        Ok(Apt::new(ctx.exec).missing(ESSENTIAL_PACKAGES)?.is_empty())
    }
}

// ============================================================================
// docker
// ============================================================================

/// Install Docker CE from the upstream repository and configure the daemon
pub struct Docker {
    settings: Rc<Settings>,
}

impl Docker {
    pub fn new(settings: &Rc<Settings>) -> Self {
        Self {
            settings: Rc::clone(settings),
        }
    }

    fn user_needs_group(&self, exec: &Executor) -> Result<Option<String>> {
        let Some(user) = &self.settings.target_user else {
            return Ok(None);
        };
        if !probe::user_exists(exec, user) {
            log::warn!("User {user} does not exist; not adding to the docker group");
            return Ok(None);
        }
        let in_group = probe::groups(exec, user).is_ok_and(|g| g.iter().any(|g| g == "docker"));
        Ok((!in_group).then(|| user.clone()))
    }
}

impl Step for Docker {
    fn name(&self) -> &'static str {
        StepName::Docker.as_str()
    }

    fn description(&self) -> String {
        "Install Docker CE and configure the daemon".to_string()
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        let exec = ctx.exec;
        let (existing, merged) = daemon_json(exec, &daemon_settings(&self.settings, false))?;
        let current = docker_repo(exec)?.is_current(exec)?
            && Apt::new(exec).missing(DOCKER_PACKAGES)?.is_empty()
            && existing.as_deref() == Some(merged.as_str())
            && self.user_needs_group(exec)?.is_none();
        if current {
            return Ok(Readiness::AlreadySatisfied("Docker installed and configured".to_string()));
        }
        Ok(Readiness::Ready)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let exec = ctx.exec;
        let apt = Apt::new(exec);
        let mut changes = Vec::new();

        if docker_repo(exec)?.ensure(exec)? {
            apt.update()?;
            changes.push("added the Docker apt repository".to_string());
        }

        let installed = apt.install(DOCKER_PACKAGES)?;
        if !installed.is_empty() {
            changes.push(format!("installed {}", installed.join(", ")));
        }

        let (_, merged) = daemon_json(exec, &daemon_settings(&self.settings, false))?;
        let daemon_changed = templates::write_if_changed(exec, Path::new(DAEMON_JSON), &merged, Some(0o644))?;
        if daemon_changed {
            changes.push(format!("updated {DAEMON_JSON}"));
        }

        if let Some(user) = self.user_needs_group(exec)? {
            exec.run_or_fail("usermod", &["-aG", "docker", &user])?;
            changes.push(format!("added {user} to the docker group"));
        }

        // A fresh install starts dockerd before daemon.json exists
        if daemon_changed {
            Systemd::new(exec).restart("docker")?;
        }

        if changes.is_empty() {
            return Ok(ApplyResult::Unchanged("Docker already configured".to_string()));
        }
        Ok(ApplyResult::Changed(changes.join("; ")))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx.exec.probe_ok("docker", &["--version"]))
    }
}

// ============================================================================
// nvidia
// ============================================================================

/// Install the NVIDIA driver and container toolkit when a GPU is present
pub struct Nvidia {
    settings: Rc<Settings>,
}

impl Nvidia {
    pub fn new(settings: &Rc<Settings>) -> Self {
        Self {
            settings: Rc::clone(settings),
        }
    }

    fn driver_package(&self) -> String {
        format!("nvidia-driver-{}", self.settings.host.nvidia_driver_version)
    }
}

impl Step for Nvidia {
    fn name(&self) -> &'static str {
        StepName::Nvidia.as_str()
    }

    fn description(&self) -> String {
        format!("Install {} and the NVIDIA container toolkit", self.driver_package())
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        let exec = ctx.exec;
        let gpus = probe::nvidia_gpus(exec)?;
        if gpus.is_empty() {
            return Ok(Readiness::NotApplicable("no GPU detected".to_string()));
        }
        for gpu in &gpus {
            log::info!("Found GPU: {gpu}");
        }

        let driver = self.driver_package();
        let (existing, merged) = daemon_json(exec, &daemon_settings(&self.settings, true))?;
        let current = nvidia_repo().is_current(exec)?
            && Apt::new(exec).missing(&[driver.as_str(), NVIDIA_TOOLKIT])?.is_empty()
            && existing.as_deref() == Some(merged.as_str());
        if current {
            return Ok(Readiness::AlreadySatisfied(format!("{driver} and toolkit installed")));
        }
        Ok(Readiness::Ready)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let exec = ctx.exec;
        let apt = Apt::new(exec);
        let driver = self.driver_package();
        let mut changes = Vec::new();

        if nvidia_repo().ensure(exec)? {
            apt.update()?;
            changes.push("added the NVIDIA container toolkit repository".to_string());
        }

        let installed = apt.install(&[driver.as_str(), NVIDIA_TOOLKIT])?;
        if installed.iter().any(|p| *p == driver) {
            log::warn!("{driver} installed; reboot to load the kernel module");
        }
        if !installed.is_empty() {
            changes.push(format!("installed {}", installed.join(", ")));
        }

        let (_, merged) = daemon_json(exec, &daemon_settings(&self.settings, true))?;
        if templates::write_if_changed(exec, Path::new(DAEMON_JSON), &merged, Some(0o644))? {
            changes.push("registered the nvidia runtime as Docker's default".to_string());
            if exec.is_dry_run() || Systemd::new(exec).unit_exists("docker.service")? {
                Systemd::new(exec).restart("docker")?;
            }
        }

        if changes.is_empty() {
            return Ok(ApplyResult::Unchanged(format!("{driver} already installed")));
        }
        Ok(ApplyResult::Changed(changes.join("; ")))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        let driver = self.driver_package();
        Ok(Apt::new(ctx.exec).missing(&[driver.as_str(), NVIDIA_TOOLKIT])?.is_empty())
    }
}

// ============================================================================
// kernel-tuning
// ============================================================================

/// Kernel parameters and file-descriptor limits
pub struct KernelTuning {
    settings: Rc<Settings>,
}

impl KernelTuning {
    pub fn new(settings: &Rc<Settings>) -> Self {
        Self {
            settings: Rc::clone(settings),
        }
    }

    fn bodies(&self) -> (String, String) {
        (
            files::sysctl_block(&self.settings.host.sysctl_params()),
            files::limits_block(self.settings.host.fd_limit),
        )
    }
}

impl Step for KernelTuning {
    fn name(&self) -> &'static str {
        StepName::KernelTuning.as_str()
    }

    fn description(&self) -> String {
        format!(
            "Tune {} kernel parameters and raise the FD limit to {}",
            self.settings.host.sysctl_params().len(),
            self.settings.host.fd_limit
        )
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        let (sysctl, limits) = self.bodies();
        let (_, sysctl_changed) =
            templates::render_block(ctx.exec, Path::new(SYSCTL_CONF), block::SYSCTL, &sysctl, Placement::Bottom)?;
        let (_, limits_changed) =
            templates::render_block(ctx.exec, Path::new(LIMITS_CONF), block::LIMITS, &limits, Placement::Bottom)?;
        if sysctl_changed || limits_changed {
            return Ok(Readiness::Ready);
        }
        Ok(Readiness::AlreadySatisfied("kernel parameters and limits in place".to_string()))
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let (sysctl, limits) = self.bodies();
        let mut changes = Vec::new();

        if templates::apply_block(ctx.exec, Path::new(SYSCTL_CONF), block::SYSCTL, &sysctl, Placement::Bottom, Some(0o644))? {
            ctx.exec.run_or_fail("sysctl", &["-p", SYSCTL_CONF])?;
            changes.push("kernel parameters applied");
        }
        if templates::apply_block(ctx.exec, Path::new(LIMITS_CONF), block::LIMITS, &limits, Placement::Bottom, Some(0o644))? {
            changes.push("file descriptor limits raised");
        }

        if changes.is_empty() {
            return Ok(ApplyResult::Unchanged("kernel parameters and limits in place".to_string()));
        }
        Ok(ApplyResult::Changed(changes.join(", ")))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        let sysctl = ctx.exec.read_to_string(Path::new(SYSCTL_CONF))?.unwrap_or_default();
        let limits = ctx.exec.read_to_string(Path::new(LIMITS_CONF))?.unwrap_or_default();
        Ok(templates::block_body(&sysctl, block::SYSCTL).is_some()
            && templates::block_body(&limits, block::LIMITS).is_some())
    }
}

// ============================================================================
// vendor-cli
// ============================================================================

/// Install the vendor CLI placeholder and the host monitor service
pub struct VendorCli {
    settings: Rc<Settings>,
}

impl VendorCli {
    pub fn new(settings: &Rc<Settings>) -> Self {
        Self {
            settings: Rc::clone(settings),
        }
    }

    /// (path, content, mode) of every installed file
    fn artifacts(&self) -> Vec<(PathBuf, String, u32)> {
        let host = &self.settings.host;
        vec![
            (
                Path::new("/usr/local/bin").join(&host.vendor_cli_name),
                files::vendor_cli_script(&host.vendor_cli_name, &host.vendor_cli_version),
                0o755,
            ),
            (
                PathBuf::from(MONITOR_SCRIPT),
                files::monitor_script(host.monitor_interval_secs),
                0o755,
            ),
            (PathBuf::from(MONITOR_UNIT_PATH), files::monitor_unit().render(), 0o644),
        ]
    }
}

impl Step for VendorCli {
    fn name(&self) -> &'static str {
        StepName::VendorCli.as_str()
    }

    fn description(&self) -> String {
        format!(
            "Install {} {} (placeholder) and the host monitor",
            self.settings.host.vendor_cli_name, self.settings.host.vendor_cli_version
        )
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        for (path, content, _) in self.artifacts() {
            if ctx.exec.read_to_string(&path)?.as_deref() != Some(content.as_str()) {
                return Ok(Readiness::Ready);
            }
        }
        Ok(Readiness::AlreadySatisfied("vendor CLI and monitor installed".to_string()))
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let mut written = Vec::new();
        for (path, content, mode) in self.artifacts() {
            if templates::write_if_changed(ctx.exec, &path, &content, Some(mode))? {
                written.push(path);
            }
        }
        if written.iter().any(|p| p == Path::new(MONITOR_UNIT_PATH)) {
            Systemd::new(ctx.exec).daemon_reload()?;
        }
        if written.is_empty() {
            return Ok(ApplyResult::Unchanged("vendor CLI and monitor installed".to_string()));
        }
        let names: Vec<String> = written.iter().map(|p| p.display().to_string()).collect();
        Ok(ApplyResult::Changed(format!("wrote {}", names.join(", "))))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        Ok(self.artifacts().iter().all(|(path, _, _)| ctx.exec.exists(path)))
    }
}

// ============================================================================
// finalizer
// ============================================================================

/// Enable and start the services the verifier expects
pub struct EnableServices;

impl Step for EnableServices {
    fn name(&self) -> &'static str {
        "enable-services"
    }

    fn description(&self) -> String {
        format!("Enable and start docker and {MONITOR_UNIT}")
    }

    fn skippable(&self) -> bool {
        false
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let systemd = Systemd::new(ctx.exec);
        let mut enabled = Vec::new();
        for unit in ["docker.service", MONITOR_UNIT] {
            if ctx.is_dry_run() || systemd.unit_exists(unit)? {
                systemd.enable_now(unit)?;
                enabled.push(unit);
            } else {
                log::warn!("{unit} is not installed; not enabling it");
            }
        }
        if enabled.is_empty() {
            return Ok(ApplyResult::Unchanged("no services to enable".to_string()));
        }
        Ok(ApplyResult::Changed(format!("enabled and started {}", enabled.join(", "))))
    }
}

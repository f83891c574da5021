//! Desktop to headless server conversion steps

use super::{Settings, StepName};
use crate::templates::files::{self, AUTO_UPGRADES, NETPLAN_FILE};
use crate::templates;
use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use stepkit::{ApplyResult, Readiness, Step, StepContext};
use syscmd::Executor;
use syscmd::apt::Apt;
use syscmd::systemd::Systemd;

/// Packages a headless server needs before the desktop goes away
const SERVER_PACKAGES: &[&str] = &[
    "openssh-server",
    "ufw",
    "unattended-upgrades",
    "netplan.io",
];

/// Day-to-day administration tools
const UTILITY_PACKAGES: &[&str] = &[
    "dnsutils",
    "iotop",
    "ncdu",
    "sysstat",
    "tmux",
    "tree",
    "vim",
];

const DESKTOP_PACKAGES: &[&str] = &[
    "ubuntu-desktop",
    "ubuntu-desktop-minimal",
    "ubuntu-session",
    "gnome-shell",
    "gdm3",
    "xorg",
    "xserver-xorg",
    "snapd-desktop-integration",
];

const SERVER_TARGET: &str = "multi-user.target";
const NETPLAN_DIR: &str = "/etc/netplan";
const DISABLED_SUFFIX: &str = "gpuhost-disabled";

fn install_list(ctx: &StepContext, packages: &[&str]) -> Result<ApplyResult> {
    let installed = Apt::new(ctx.exec).install(packages)?;
    if installed.is_empty() {
        return Ok(ApplyResult::Unchanged("all packages installed".to_string()));
    }
    Ok(ApplyResult::Changed(format!("installed {}", installed.join(", "))))
}

fn list_satisfied(ctx: &StepContext, packages: &[&str]) -> Result<Readiness> {
    if Apt::new(ctx.exec).missing(packages)?.is_empty() {
        return Ok(Readiness::AlreadySatisfied(format!("all {} packages installed", packages.len())));
    }
    Ok(Readiness::Ready)
}

// ============================================================================
// server-packages
// ============================================================================

/// Install SSH, firewall, netplan and unattended upgrades
pub struct ServerPackages;

impl Step for ServerPackages {
    fn name(&self) -> &'static str {
        StepName::ServerPackages.as_str()
    }

    fn description(&self) -> String {
        format!("Install server packages ({})", SERVER_PACKAGES.join(", "))
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        list_satisfied(ctx, SERVER_PACKAGES)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        install_list(ctx, SERVER_PACKAGES)
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        Ok(Apt::new(ctx.exec).missing(SERVER_PACKAGES)?.is_empty())
    }
}

// ============================================================================
// desktop-removal
// ============================================================================

/// Purge the desktop environment and boot to a text target
pub struct DesktopRemoval;

impl Step for DesktopRemoval {
    fn name(&self) -> &'static str {
        StepName::DesktopRemoval.as_str()
    }

    fn description(&self) -> String {
        format!("Remove the desktop environment and boot to {SERVER_TARGET}")
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        let present = Apt::new(ctx.exec).present(DESKTOP_PACKAGES)?;
        let target = Systemd::new(ctx.exec).default_target().unwrap_or_default();
        if present.is_empty() && target == SERVER_TARGET {
            return Ok(Readiness::AlreadySatisfied("no desktop packages installed".to_string()));
        }
        Ok(Readiness::Ready)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let present = Apt::new(ctx.exec).present(DESKTOP_PACKAGES)?;
        if !present.is_empty() {
            let prompt = format!("Purge {}? The desktop cannot be restored automatically.", present.join(", "));
            if !ctx.confirm(&prompt)? {
                log::warn!("Desktop removal declined; keeping {}", present.join(", "));
                return Ok(ApplyResult::Unchanged("desktop kept at the operator's request".to_string()));
            }
        }

        let mut changes = Vec::new();
        let purged = Apt::new(ctx.exec).purge(&present)?;
        if !purged.is_empty() {
            changes.push(format!("purged {}", purged.join(", ")));
        }
        let systemd = Systemd::new(ctx.exec);
        if systemd.default_target().unwrap_or_default() != SERVER_TARGET {
            systemd.set_default(SERVER_TARGET)?;
            changes.push(format!("default target set to {SERVER_TARGET}"));
        }

        if changes.is_empty() {
            return Ok(ApplyResult::Unchanged("no desktop packages installed".to_string()));
        }
        Ok(ApplyResult::Changed(changes.join("; ")))
    }
}

// ============================================================================
// network-switch
// ============================================================================

/// Hand wired interfaces from NetworkManager to systemd-networkd
pub struct NetworkSwitch;

impl NetworkSwitch {
    fn rendered(exec: &Executor) -> Result<String> {
        let links = exec.probe_stdout("ip", &["-o", "link", "show"])?;
        let interfaces = files::wired_interfaces(&links);
        if interfaces.is_empty() {
            bail!("no wired network interface found; refusing to drop NetworkManager");
        }
        Ok(files::netplan_networkd(&interfaces))
    }

    /// Other netplan files that would compete with ours.
    fn competing(exec: &Executor) -> Result<Vec<PathBuf>> {
        let listing = exec.probe("ls", &["-1", NETPLAN_DIR])?;
        Ok(listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.ends_with(".yaml") || name.ends_with(".yml"))
            .map(|name| Path::new(NETPLAN_DIR).join(name))
            .filter(|path| path != Path::new(NETPLAN_FILE))
            .collect())
    }
}

impl Step for NetworkSwitch {
    fn name(&self) -> &'static str {
        StepName::NetworkSwitch.as_str()
    }

    fn description(&self) -> String {
        "Switch networking from NetworkManager to systemd-networkd".to_string()
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        let exec = ctx.exec;
        let current = exec.read_to_string(Path::new(NETPLAN_FILE))?.as_deref() == Some(Self::rendered(exec)?.as_str())
            && Self::competing(exec)?.is_empty()
            && !Systemd::new(exec).is_active("NetworkManager")?;
        if current {
            return Ok(Readiness::AlreadySatisfied("systemd-networkd already manages the network".to_string()));
        }
        Ok(Readiness::Ready)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let exec = ctx.exec;
        let systemd = Systemd::new(exec);
        let yaml = Self::rendered(exec)?;

        templates::write_if_changed(exec, Path::new(NETPLAN_FILE), &yaml, Some(0o600))?;
        for path in Self::competing(exec)? {
            let disabled = PathBuf::from(format!("{}.{DISABLED_SUFFIX}", path.display()));
            exec.rename(&path, &disabled)?;
        }

        exec.run_or_fail("netplan", &["generate"])?;
        systemd.enable_now("systemd-networkd")?;
        exec.run_or_fail("netplan", &["apply"])?;
        if exec.is_dry_run() || systemd.is_active("NetworkManager")? {
            systemd.disable_now("NetworkManager")?;
        }
        Ok(ApplyResult::Changed(format!("{NETPLAN_FILE} written, systemd-networkd enabled")))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx.exec.exists(Path::new(NETPLAN_FILE)))
    }
}

// ============================================================================
// firewall
// ============================================================================

/// Whether `ufw status` output allows `port/tcp`.
fn port_allowed(status: &str, port: u16) -> bool {
    let rule = format!("{port}/tcp");
    status.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some(rule.as_str()) && fields.next() == Some("ALLOW")
    })
}

/// Deny inbound except SSH, never locking out the current session
pub struct Firewall {
    settings: Rc<Settings>,
}

impl Firewall {
    pub fn new(settings: &Rc<Settings>) -> Self {
        Self {
            settings: Rc::clone(settings),
        }
    }
}

impl Step for Firewall {
    fn name(&self) -> &'static str {
        StepName::Firewall.as_str()
    }

    fn description(&self) -> String {
        format!("Enable ufw allowing SSH on port {}", self.settings.host.ssh_port)
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        let status = ctx.exec.probe("ufw", &["status"])?.stdout;
        if status.contains("Status: active") && port_allowed(&status, self.settings.host.ssh_port) {
            return Ok(Readiness::AlreadySatisfied("ufw active with SSH allowed".to_string()));
        }
        Ok(Readiness::Ready)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let exec = ctx.exec;
        let port = self.settings.host.ssh_port;
        let rule = format!("{port}/tcp");

        if !Systemd::new(exec).is_active("ssh")? {
            if exec.is_dry_run() {
                log::warn!("ssh is not active; a real run would refuse to enable the firewall");
            } else {
                bail!("ssh is not active; refusing to enable the firewall");
            }
        }

        exec.run_or_fail("ufw", &["default", "deny", "incoming"])?;
        exec.run_or_fail("ufw", &["default", "allow", "outgoing"])?;
        exec.run_or_fail("ufw", &["allow", &rule])?;

        if !exec.is_dry_run() {
            let status = exec.probe("ufw", &["show", "added"])?.stdout;
            if !status.contains(&format!("allow {rule}")) {
                bail!("ufw did not record the {rule} rule; refusing to enable the firewall");
            }
        }

        exec.run_or_fail("ufw", &["--force", "enable"])?;
        Ok(ApplyResult::Changed(format!("ufw enabled, {rule} allowed")))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        let status = ctx.exec.probe("ufw", &["status"])?.stdout;
        Ok(status.contains("Status: active") && port_allowed(&status, self.settings.host.ssh_port))
    }
}

// ============================================================================
// auto-updates
// ============================================================================

/// Daily package list refresh and unattended security upgrades
pub struct AutoUpdates;

impl Step for AutoUpdates {
    fn name(&self) -> &'static str {
        StepName::AutoUpdates.as_str()
    }

    fn description(&self) -> String {
        "Configure unattended upgrades".to_string()
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        if ctx.exec.read_to_string(Path::new(AUTO_UPGRADES))?.as_deref() == Some(files::auto_upgrades().as_str()) {
            return Ok(Readiness::AlreadySatisfied(format!("{AUTO_UPGRADES} up to date")));
        }
        Ok(Readiness::Ready)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        templates::write_if_changed(ctx.exec, Path::new(AUTO_UPGRADES), &files::auto_upgrades(), Some(0o644))?;
        Systemd::new(ctx.exec).enable_now("unattended-upgrades")?;
        Ok(ApplyResult::Changed(format!("{AUTO_UPGRADES} written, unattended-upgrades enabled")))
    }
}

// ============================================================================
// utilities
// ============================================================================

/// Install administration utilities
pub struct Utilities;

impl Step for Utilities {
    fn name(&self) -> &'static str {
        StepName::Utilities.as_str()
    }

    fn description(&self) -> String {
        format!("Install {} administration utilities", UTILITY_PACKAGES.len())
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        list_satisfied(ctx, UTILITY_PACKAGES)
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        install_list(ctx, UTILITY_PACKAGES)
    }
}

// ============================================================================
// finalizer
// ============================================================================

/// Make sure SSH survives the conversion
pub struct EnableSsh;

impl Step for EnableSsh {
    fn name(&self) -> &'static str {
        "enable-ssh"
    }

    fn description(&self) -> String {
        "Enable and start ssh".to_string()
    }

    fn skippable(&self) -> bool {
        false
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        Systemd::new(ctx.exec).enable_now("ssh")?;
        Ok(ApplyResult::Changed("ssh enabled and started".to_string()))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        Ok(Systemd::new(ctx.exec).is_active("ssh")?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use stepkit::{AutoDecline, RunConfig};
    use syscmd::CommandOutput;
    use syscmd::backend::scripted::ScriptedBackend;

    const UFW_ACTIVE: &str = "Status: active\n\nTo                         Action      From\n--                         ------      ----\n22/tcp                     ALLOW       Anywhere\n";

    #[test]
    fn test_desktop_purge_spares_server_packages() {
        for package in SERVER_PACKAGES.iter().chain(UTILITY_PACKAGES) {
            assert!(!DESKTOP_PACKAGES.contains(package), "{package}");
        }
    }

    #[test]
    fn test_port_allowed() {
        assert!(port_allowed(UFW_ACTIVE, 22));
        assert!(!port_allowed(UFW_ACTIVE, 2222));
        assert!(!port_allowed("Status: inactive\n", 22));
    }

    #[test]
    fn test_firewall_refuses_without_ssh() {
        let backend = fresh_host();
        backend.on("systemctl is-active ssh", CommandOutput::ok("inactive\n"));
        let step = Firewall::new(&settings());

        let err = with_ctx(&backend, RunConfig::new(), |ctx| step.apply(ctx).unwrap_err());
        assert!(err.to_string().contains("refusing to enable the firewall"));
        assert!(!backend.commands().iter().any(|c| c.starts_with("ufw")));
    }

    #[test]
    fn test_firewall_refuses_when_rule_missing() {
        let backend = fresh_host();
        backend.on("ufw show added", CommandOutput::ok("Added user rules (see 'ufw status' for running firewall):\n"));
        let step = Firewall::new(&settings());

        with_ctx(&backend, RunConfig::new(), |ctx| assert!(step.apply(ctx).is_err()));
        assert!(!backend.commands().contains(&"ufw --force enable".to_string()));
    }

    #[test]
    fn test_firewall_enables_after_rule() {
        let backend = fresh_host();
        backend.on("ufw show added", CommandOutput::ok("ufw allow 22/tcp\n"));
        let step = Firewall::new(&settings());

        with_ctx(&backend, RunConfig::new(), |ctx| step.apply(ctx).unwrap());
        let ufw: Vec<String> = backend.commands().into_iter().filter(|c| c.starts_with("ufw")).collect();
        assert_eq!(ufw.first().map(String::as_str), Some("ufw default deny incoming"));
        assert_eq!(ufw.last().map(String::as_str), Some("ufw --force enable"));
    }

    #[test]
    fn test_desktop_removal_respects_decline() {
        let backend = fresh_host();
        backend.with_packages(&["ubuntu-desktop", "gdm3"]);
        let exec = Executor::new(Box::new(backend.clone()));
        let config = RunConfig::new();
        let mut decline = AutoDecline;
        let mut ctx = StepContext::new(&config, &exec, &mut decline);

        let result = DesktopRemoval.apply(&mut ctx).unwrap();
        assert!(matches!(result, ApplyResult::Unchanged(_)));
        assert!(backend.has_package("gdm3"));
    }

    #[test]
    fn test_desktop_removal_purges_and_sets_target() {
        let backend = fresh_host();
        backend
            .with_packages(&["ubuntu-desktop", "gdm3", "openssh-server"])
            .on("systemctl get-default", CommandOutput::ok("graphical.target\n"));

        with_ctx(&backend, RunConfig::new(), |ctx| DesktopRemoval.apply(ctx).unwrap());
        assert!(!backend.has_package("gdm3"));
        assert!(backend.has_package("openssh-server"));
        assert!(backend.commands().contains(&"systemctl set-default multi-user.target".to_string()));
    }

    fn networked_host() -> ScriptedBackend {
        let backend = fresh_host();
        backend
            .on("ip -o link show", CommandOutput::ok("1: lo: <LOOPBACK>\n2: eno1: <BROADCAST>\n"))
            .on("ls -1 /etc/netplan", CommandOutput::ok("01-network-manager-all.yaml\n"))
            .with_file("/etc/netplan/01-network-manager-all.yaml", "network:\n  renderer: NetworkManager\n");
        backend
    }

    #[test]
    fn test_network_switch_disables_competing_config() {
        let backend = networked_host();
        with_ctx(&backend, RunConfig::new(), |ctx| NetworkSwitch.apply(ctx).unwrap());

        assert!(backend.file(NETPLAN_FILE).unwrap().contains("    eno1:\n"));
        assert!(backend.file("/etc/netplan/01-network-manager-all.yaml").is_none());
        assert!(backend.file("/etc/netplan/01-network-manager-all.yaml.gpuhost-disabled").is_some());
        let commands = backend.commands();
        let generate = commands.iter().position(|c| c == "netplan generate").unwrap();
        let apply = commands.iter().position(|c| c == "netplan apply").unwrap();
        assert!(generate < apply);
        assert!(commands.contains(&"systemctl disable --now NetworkManager".to_string()));
    }

    #[test]
    fn test_network_switch_needs_wired_interface() {
        let backend = networked_host();
        backend.on("ip -o link show", CommandOutput::ok("1: lo: <LOOPBACK>\n3: wlp2s0: <BROADCAST>\n"));
        let err = with_ctx(&backend, RunConfig::new(), |ctx| NetworkSwitch.apply(ctx).unwrap_err());
        assert!(err.to_string().contains("no wired network interface"));
        assert!(backend.mutations().is_empty());
    }

    #[test]
    fn test_auto_updates_idempotent() {
        let backend = fresh_host();
        with_ctx(&backend, RunConfig::new(), |ctx| {
            assert_eq!(AutoUpdates.precondition(ctx).unwrap(), Readiness::Ready);
            AutoUpdates.apply(ctx).unwrap();
            assert!(matches!(AutoUpdates.precondition(ctx).unwrap(), Readiness::AlreadySatisfied(_)));
        });
    }
}

//! systemctl helpers

use crate::Executor;
use crate::error::Result;

/// systemd operations routed through an [`Executor`].
#[derive(Debug, Clone, Copy)]
pub struct Systemd<'a> {
    exec: &'a Executor,
}

impl<'a> Systemd<'a> {
    /// Create a systemd helper over an executor.
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        self.exec.run_or_fail("systemctl", args)?;
        Ok(())
    }

    /// Reload unit files after writing new ones.
    pub fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"])
    }

    /// Enable a unit at boot.
    pub fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["enable", unit])
    }

    /// Enable a unit and start it immediately.
    pub fn enable_now(&self, unit: &str) -> Result<()> {
        self.systemctl(&["enable", "--now", unit])
    }

    /// Disable a unit and stop it immediately.
    pub fn disable_now(&self, unit: &str) -> Result<()> {
        self.systemctl(&["disable", "--now", unit])
    }

    /// Start a unit.
    pub fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start", unit])
    }

    /// Restart a unit.
    pub fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl(&["restart", unit])
    }

    /// Reload a unit's configuration.
    pub fn reload(&self, unit: &str) -> Result<()> {
        self.systemctl(&["reload", unit])
    }

    /// Set the default boot target.
    pub fn set_default(&self, target: &str) -> Result<()> {
        self.systemctl(&["set-default", target])
    }

    /// `systemctl is-active` state string ("active", "inactive", "failed", ...).
    pub fn active_state(&self, unit: &str) -> Result<String> {
        let output = self.exec.probe("systemctl", &["is-active", unit])?;
        Ok(output.stdout_trimmed().to_string())
    }

    /// `systemctl is-enabled` state string ("enabled", "disabled", ...).
    pub fn enabled_state(&self, unit: &str) -> Result<String> {
        let output = self.exec.probe("systemctl", &["is-enabled", unit])?;
        Ok(output.stdout_trimmed().to_string())
    }

    /// Whether a unit is currently active.
    pub fn is_active(&self, unit: &str) -> Result<bool> {
        Ok(self.active_state(unit)? == "active")
    }

    /// The current default boot target.
    pub fn default_target(&self) -> Result<String> {
        self.exec.probe_stdout("systemctl", &["get-default"])
    }

    /// Whether systemd knows a unit file by this name.
    pub fn unit_exists(&self, unit: &str) -> Result<bool> {
        let output = self
            .exec
            .probe("systemctl", &["list-unit-files", "--no-legend", unit])?;
        Ok(output.success() && output.stdout.contains(unit))
    }
}

//! apt/dpkg helpers.
//!
//! All installs and removals compute the delta first, so calling them with
//! packages that are already in the requested state is a no-op.

use crate::error::Result;
use crate::types::CommandSpec;
use crate::Executor;

/// Keeps apt from prompting on configuration files and service restarts.
const FRONTEND_ENV: (&str, &str) = ("DEBIAN_FRONTEND", "noninteractive");

/// apt operations routed through an [`Executor`].
#[derive(Debug, Clone, Copy)]
pub struct Apt<'a> {
    exec: &'a Executor,
}

impl<'a> Apt<'a> {
    /// Create an apt helper over an executor.
    pub fn new(exec: &'a Executor) -> Self {
        Self { exec }
    }

    fn apt_get(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("apt-get")
            .args(args)
            .env(FRONTEND_ENV.0, FRONTEND_ENV.1)
    }

    /// Refresh package lists.
    pub fn update(&self) -> Result<()> {
        self.exec.run_spec_or_fail(self.apt_get(&["update"]))?;
        Ok(())
    }

    /// Upgrade all installed packages.
    pub fn upgrade(&self) -> Result<()> {
        self.exec.run_spec_or_fail(self.apt_get(&["upgrade", "-y"]))?;
        Ok(())
    }

    /// Check whether a package is installed.
    pub fn is_installed(&self, name: &str) -> Result<bool> {
        let output = self
            .exec
            .probe("dpkg-query", &["-W", "-f=${Status}", name])?;
        Ok(output.success() && output.stdout.contains("install ok installed"))
    }

    /// Filter `names` down to those not yet installed, keeping order.
    pub fn missing<'p>(&self, names: &[&'p str]) -> Result<Vec<&'p str>> {
        let mut missing = Vec::new();
        for name in names {
            if !self.is_installed(name)? {
                missing.push(*name);
            }
        }
        Ok(missing)
    }

    /// Filter `names` down to those currently installed, keeping order.
    pub fn present<'p>(&self, names: &[&'p str]) -> Result<Vec<&'p str>> {
        let mut present = Vec::new();
        for name in names {
            if self.is_installed(name)? {
                present.push(*name);
            }
        }
        Ok(present)
    }

    /// Install the packages that are missing. Returns what was installed.
    pub fn install(&self, names: &[&str]) -> Result<Vec<String>> {
        let missing = self.missing(names)?;
        if missing.is_empty() {
            log::debug!("All {} packages already installed", names.len());
            return Ok(Vec::new());
        }

        let mut args = vec!["install", "-y"];
        args.extend(missing.iter().copied());
        self.exec.run_spec_or_fail(self.apt_get(&args))?;
        Ok(missing.into_iter().map(str::to_string).collect())
    }

    /// Purge the packages that are installed. Returns what was purged.
    pub fn purge(&self, names: &[&str]) -> Result<Vec<String>> {
        let present = self.present(names)?;
        if present.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["purge", "-y"];
        args.extend(present.iter().copied());
        self.exec.run_spec_or_fail(self.apt_get(&args))?;
        Ok(present.into_iter().map(str::to_string).collect())
    }

    /// Remove packages that are no longer needed.
    pub fn autoremove(&self) -> Result<()> {
        self.exec
            .run_spec_or_fail(self.apt_get(&["autoremove", "-y"]))?;
        Ok(())
    }

    /// Clear out obsolete downloaded package files.
    pub fn autoclean(&self) -> Result<()> {
        self.exec.run_spec_or_fail(self.apt_get(&["autoclean"]))?;
        Ok(())
    }

    /// Snapshot the full package selection list (`dpkg --get-selections`).
    pub fn selections(&self) -> Result<String> {
        let spec = CommandSpec::new("dpkg").arg("--get-selections");
        let output = self.exec.probe_spec(&spec)?;
        if !output.success() {
            return Err(crate::Error::ExternalCommand {
                command: spec.display(),
                exit_code: output.exit_code,
                stderr: output.stderr_trimmed().to_string(),
                timed_out: output.timed_out,
            });
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedBackend;

    #[test]
    fn test_install_only_missing() {
        let backend = ScriptedBackend::new();
        backend.with_packages(&["curl"]);
        let exec = Executor::new(Box::new(backend.clone()));
        let apt = Apt::new(&exec);

        let installed = apt.install(&["curl", "jq"]).unwrap();
        assert_eq!(installed, vec!["jq".to_string()]);
        assert!(
            backend
                .commands()
                .contains(&"apt-get install -y jq".to_string())
        );

        backend.clear_calls();
        assert!(apt.install(&["curl", "jq"]).unwrap().is_empty());
        assert!(backend.mutations().is_empty());
    }

    #[test]
    fn test_purge_only_present() {
        let backend = ScriptedBackend::new();
        backend.with_packages(&["gdm3"]);
        let exec = Executor::new(Box::new(backend.clone()));
        let apt = Apt::new(&exec);

        let purged = apt.purge(&["gdm3", "gnome-shell"]).unwrap();
        assert_eq!(purged, vec!["gdm3".to_string()]);
        assert!(!backend.has_package("gdm3"));
    }

    #[test]
    fn test_selections_snapshot() {
        let backend = ScriptedBackend::new();
        backend.with_packages(&["bash", "coreutils"]);
        let exec = Executor::new(Box::new(backend)).dry_run(true);
        let listing = Apt::new(&exec).selections().unwrap();
        assert!(listing.contains("bash"));
        assert!(listing.contains("coreutils"));
    }
}

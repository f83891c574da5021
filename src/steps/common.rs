//! Steps shared by both sequences

use super::{Settings, StepName};
use crate::config::PasswordAuth;
use crate::probe;
use crate::templates::files::{SSHD_CONFIG, SshdSettings, block};
use crate::templates::{self, Placement};
use anyhow::{Context, Result, bail};
use restorepoint::{BackupManager, MANIFEST_FILE};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use stepkit::{ApplyResult, Readiness, Step, StepContext};
use syscmd::apt::Apt;
use syscmd::systemd::Systemd;

// ============================================================================
// backup
// ============================================================================

/// Snapshot config files and package selections before anything changes
pub struct Backup {
    settings: Rc<Settings>,
    paths: Vec<PathBuf>,
}

impl Backup {
    pub fn new(settings: &Rc<Settings>, paths: Vec<PathBuf>) -> Self {
        Self {
            settings: Rc::clone(settings),
            paths,
        }
    }
}

impl Step for Backup {
    fn name(&self) -> &'static str {
        StepName::Backup.as_str()
    }

    fn description(&self) -> String {
        format!("Create a restore point under {}", self.settings.backup_root.display())
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let selections = Apt::new(ctx.exec)
            .selections()
            .context("snapshotting package selections")?;
        let record = BackupManager::new(ctx.exec, &self.settings.backup_root)
            .create_restore_point(&self.paths, Some(&selections))
            .context("creating restore point")?;

        let summary = format!(
            "restore point {} ({} copied, {} not present)",
            record.destination.display(),
            record.entries.len(),
            record.missing.len()
        );
        if ctx.is_dry_run() {
            return Ok(ApplyResult::Changed(format!("would create {summary}")));
        }
        ctx.set_restore_point(record.destination);
        Ok(ApplyResult::Changed(summary))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        Ok(ctx
            .restore_point()
            .is_some_and(|dir| ctx.exec.exists(&dir.join(MANIFEST_FILE))))
    }
}

// ============================================================================
// package-update
// ============================================================================

/// Refresh package lists and upgrade installed packages
pub struct PackageUpdate;

impl Step for PackageUpdate {
    fn name(&self) -> &'static str {
        StepName::PackageUpdate.as_str()
    }

    fn description(&self) -> String {
        "Refresh package lists and upgrade installed packages".to_string()
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let apt = Apt::new(ctx.exec);
        apt.update()?;
        apt.upgrade()?;
        Ok(ApplyResult::Changed("package lists refreshed, packages upgraded".to_string()))
    }
}

// ============================================================================
// ssh-hardening
// ============================================================================

/// Enforce sshd settings through a managed block at the top of sshd_config
pub struct SshHardening {
    settings: Rc<Settings>,
}

impl SshHardening {
    pub fn new(settings: &Rc<Settings>) -> Self {
        Self {
            settings: Rc::clone(settings),
        }
    }

    /// Resolve the password-auth policy against the target user's keys.
    fn password_authentication(&self, ctx: &StepContext) -> Result<Option<bool>> {
        match self.settings.host.password_authentication {
            PasswordAuth::Keep => Ok(None),
            PasswordAuth::Yes => Ok(Some(true)),
            PasswordAuth::No => {
                let has_keys = match &self.settings.target_user {
                    Some(user) => probe::has_authorized_keys(ctx.exec, user)?,
                    None => false,
                };
                if has_keys {
                    Ok(Some(false))
                } else {
                    log::warn!(
                        "Keeping password authentication: {} has no authorized SSH keys",
                        self.settings.target_user.as_deref().unwrap_or("the target user")
                    );
                    Ok(None)
                }
            }
        }
    }

    fn sshd_settings(&self, ctx: &StepContext) -> Result<SshdSettings> {
        let host = &self.settings.host;
        Ok(SshdSettings {
            port: host.ssh_port,
            permit_root_login: host.permit_root_login.as_str(),
            max_auth_tries: host.max_auth_tries,
            password_authentication: self.password_authentication(ctx)?,
        })
    }
}

impl Step for SshHardening {
    fn name(&self) -> &'static str {
        StepName::SshHardening.as_str()
    }

    fn description(&self) -> String {
        format!(
            "Harden sshd (port {}, root login {}, {} auth tries)",
            self.settings.host.ssh_port,
            self.settings.host.permit_root_login.as_str(),
            self.settings.host.max_auth_tries
        )
    }

    fn precondition(&self, ctx: &StepContext) -> Result<Readiness> {
        let path = Path::new(SSHD_CONFIG);
        if !ctx.exec.exists(path) {
            // In a dry run the server-packages step has not installed it yet.
            if ctx.is_dry_run() {
                return Ok(Readiness::Ready);
            }
            bail!("{SSHD_CONFIG} not found; is openssh-server installed?");
        }
        let body = self.sshd_settings(ctx)?.block();
        let (_, changed) = templates::render_block(ctx.exec, path, block::SSH, &body, Placement::Top)?;
        if changed {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::AlreadySatisfied("sshd settings already in place".to_string()))
        }
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let path = Path::new(SSHD_CONFIG);
        let previous = ctx.exec.read_to_string(path)?.unwrap_or_default();
        let body = self.sshd_settings(ctx)?.block();
        templates::apply_block(ctx.exec, path, block::SSH, &body, Placement::Top, Some(0o644))?;

        let check = ctx.exec.run("sshd", &["-t"])?;
        if !check.success() {
            ctx.exec
                .write_file(path, &previous, Some(0o644))
                .context("restoring previous sshd_config")?;
            bail!("sshd rejected the new configuration, previous file restored: {}", check.stderr_trimmed());
        }

        let systemd = Systemd::new(ctx.exec);
        if systemd.is_active("ssh")? {
            systemd.reload("ssh")?;
        }
        Ok(ApplyResult::Changed(format!("sshd hardened on port {}", self.settings.host.ssh_port)))
    }

    fn postcondition(&self, ctx: &StepContext) -> Result<bool> {
        let content = ctx.exec.read_to_string(Path::new(SSHD_CONFIG))?.unwrap_or_default();
        Ok(templates::block_body(&content, block::SSH).is_some())
    }
}

// ============================================================================
// cleanup
// ============================================================================

/// Remove orphaned packages and stale package files
pub struct Cleanup;

impl Step for Cleanup {
    fn name(&self) -> &'static str {
        StepName::Cleanup.as_str()
    }

    fn description(&self) -> String {
        "Remove unused packages and clean the apt cache".to_string()
    }

    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult> {
        let apt = Apt::new(ctx.exec);
        apt.autoremove()?;
        apt.autoclean()?;
        Ok(ApplyResult::Changed("unused packages removed, apt cache cleaned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::HostConfig;
    use std::sync::atomic::AtomicBool;
    use stepkit::{CancelFlag, NoObserver, RunConfig, Runner, StepOutcome};
    use crate::templates::docker::DAEMON_JSON;
    use syscmd::CommandOutput;
    use syscmd::backend::scripted::Call;

    fn settings_with(host: HostConfig, backup_root: PathBuf) -> Rc<Settings> {
        Rc::new(Settings {
            host,
            target_user: Some("alice".into()),
            backup_root,
            assume_yes: true,
        })
    }

    #[test]
    fn test_backup_sets_restore_point() {
        let backup = Backup::new(
            &settings(),
            vec![PathBuf::from(DAEMON_JSON), PathBuf::from("/etc/absent.conf")],
        );
        let backend = fresh_host();
        backend
            .with_file(DAEMON_JSON, "{}")
            .with_packages(&["openssh-server"]);

        let restore_point = with_ctx(&backend, RunConfig::new(), |ctx| {
            let result = backup.apply(ctx).unwrap();
            assert!(matches!(result, ApplyResult::Changed(ref s) if s.contains("1 copied, 1 not present")));
            assert!(backup.postcondition(ctx).unwrap());
            ctx.restore_point().map(Path::to_path_buf)
        });

        let restore_point = restore_point.unwrap();
        assert!(restore_point.starts_with("/nonexistent/backups"));
        let snapshot = backend.file(restore_point.join(restorepoint::PACKAGES_FILE)).unwrap();
        assert!(snapshot.contains("openssh-server"));
        let copy = restore_point.join("files/etc/docker/daemon.json");
        assert_eq!(backend.file(&copy).as_deref(), Some("{}"));
        assert!(backend.mutations().contains(&Call::Write(copy)));
        assert!(!Path::new("/nonexistent/backups").exists());
    }

    #[test]
    fn test_backup_dry_run_plans_copies() {
        let backup = Backup::new(&settings(), vec![PathBuf::from("/etc/sysctl.conf")]);
        let backend = fresh_host();

        let outcome = run_one(Box::new(backup), &backend, RunConfig::new().dry_run(true));
        let StepOutcome::DryRun { actions } = outcome else {
            panic!("expected a dry-run outcome, got {outcome:?}");
        };
        assert!(actions.iter().any(|a| a.contains("files/etc/sysctl.conf")));
        assert!(backend.mutations().is_empty());
    }

    #[test]
    fn test_failure_after_backup_reports_restore_point() {
        let backend = fresh_host();
        backend.on("apt-get update", CommandOutput::failed(100, "Temporary failure resolving"));

        let runner = Runner::new(vec![
            Box::new(Backup::new(&settings(), vec![PathBuf::from("/etc/sysctl.conf")])),
            Box::new(PackageUpdate),
            Box::new(Cleanup),
        ])
        .unwrap();
        let flag = AtomicBool::new(false);
        let err = with_ctx(&backend, RunConfig::new(), |ctx| {
            runner.execute(ctx, &mut NoObserver, CancelFlag::new(&flag)).unwrap_err()
        });

        let restore_point = err.restore_point().unwrap();
        assert!(restore_point.starts_with("/nonexistent/backups"));
        assert!(backend.file(restore_point.join(MANIFEST_FILE)).is_some());
        assert_eq!(err.completed(), ["backup"]);
        assert!(!backend.commands().iter().any(|c| c.contains("autoremove")));
    }

    #[test]
    fn test_ssh_block_goes_first_and_is_idempotent() {
        let settings = settings();
        let step = SshHardening::new(&settings);
        let backend = fresh_host();

        with_ctx(&backend, RunConfig::new(), |ctx| {
            assert_eq!(step.precondition(ctx).unwrap(), Readiness::Ready);
            step.apply(ctx).unwrap();
            assert!(step.postcondition(ctx).unwrap());
            assert!(matches!(step.precondition(ctx).unwrap(), Readiness::AlreadySatisfied(_)));
        });

        let content = backend.file(SSHD_CONFIG).unwrap();
        assert!(content.starts_with("# BEGIN gpuhost:ssh\nPort 22\nPermitRootLogin no\nMaxAuthTries 3\n"));
        assert!(!content.contains("PasswordAuthentication"));
        assert!(backend.commands().contains(&"systemctl reload ssh".to_string()));
    }

    #[test]
    fn test_ssh_reverts_rejected_config() {
        let settings = settings();
        let step = SshHardening::new(&settings);
        let backend = fresh_host();
        let original = backend.file(SSHD_CONFIG).unwrap();
        backend.on("sshd -t", CommandOutput::failed(255, "Bad configuration option"));

        let err = with_ctx(&backend, RunConfig::new(), |ctx| step.apply(ctx).unwrap_err());
        assert!(err.to_string().contains("previous file restored"));
        assert_eq!(backend.file(SSHD_CONFIG).unwrap(), original);
    }

    #[test]
    fn test_password_auth_disabled_only_with_keys() {
        let host = HostConfig {
            password_authentication: PasswordAuth::No,
            ..HostConfig::default()
        };
        let settings = settings_with(host, PathBuf::from("/nonexistent"));
        let step = SshHardening::new(&settings);

        let without_keys = fresh_host();
        with_ctx(&without_keys, RunConfig::new(), |ctx| step.apply(ctx).unwrap());
        assert!(!without_keys.file(SSHD_CONFIG).unwrap().contains("PasswordAuthentication"));

        let with_keys = fresh_host();
        with_keys
            .on("getent passwd alice", CommandOutput::ok("alice:x:1000:1000::/home/alice:/bin/bash\n"))
            .with_file("/home/alice/.ssh/authorized_keys", "ssh-ed25519 AAAA alice\n");
        with_ctx(&with_keys, RunConfig::new(), |ctx| step.apply(ctx).unwrap());
        assert!(with_keys.file(SSHD_CONFIG).unwrap().contains("PasswordAuthentication no"));
    }

    #[test]
    fn test_cleanup_dry_run_plans_commands() {
        let backend = fresh_host();
        backend.clear_calls();
        let runner = Runner::new(vec![Box::new(Cleanup)]).unwrap();
        let flag = AtomicBool::new(false);
        let summary = with_ctx(&backend, RunConfig::new().dry_run(true), |ctx| {
            runner.execute(ctx, &mut NoObserver, CancelFlag::new(&flag)).unwrap()
        });
        match &summary.get("cleanup").unwrap().outcome {
            StepOutcome::DryRun { actions } => assert_eq!(actions.len(), 2),
            other => panic!("{other:?}"),
        }
        assert!(backend.mutations().is_empty());
    }
}

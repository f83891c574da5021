//! Creating and restoring restore points
//!
//! All host access goes through a [`syscmd::Executor`], so a dry-run
//! executor turns a backup or a restore into a list of planned writes.

use crate::error::{Error, Result};
use crate::record::{BackupEntry, BackupRecord, EntryKind, MANIFEST_FILE, PACKAGES_FILE};
use chrono::Local;
use std::path::{Path, PathBuf};
use syscmd::{Executor, FileKind, FileStat};

/// Per-file outcome of a restore.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl RestoreReport {
    /// Check if every backed-up file made it back.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the directory tree of restore points.
#[derive(Debug, Clone)]
pub struct BackupManager<'a> {
    exec: &'a Executor,
    root: PathBuf,
}

impl<'a> BackupManager<'a> {
    /// Manage restore points under `root`.
    pub fn new(exec: &'a Executor, root: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            root: root.into(),
        }
    }

    /// Directory holding all restore points.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy every existing path into a fresh dated directory.
    ///
    /// Missing paths are recorded and skipped. Directories are copied
    /// recursively; symlinks are recorded as links, never followed.
    /// `package_selections` is stored verbatim as the package snapshot.
    pub fn create_restore_point(
        &self,
        sources: &[PathBuf],
        package_selections: Option<&str>,
    ) -> Result<BackupRecord> {
        let timestamp = Local::now();
        let destination = self.claim_directory(&timestamp.format("%Y%m%d-%H%M%S").to_string())?;
        log::info!("Creating restore point at {}", destination.display());

        let mut record = BackupRecord {
            timestamp,
            sources: sources.to_vec(),
            missing: Vec::new(),
            entries: Vec::new(),
            package_snapshot: None,
            destination,
        };

        for source in sources {
            let Some(stat) = self.exec.stat(source)? else {
                log::debug!("Backup source {} does not exist, skipping", source.display());
                record.missing.push(source.clone());
                continue;
            };
            let mut entries = Vec::new();
            self.copy_tree(source, stat, &record, &mut entries)?;
            record.entries.extend(entries);
        }

        if let Some(selections) = package_selections {
            let path = record.destination.join(PACKAGES_FILE);
            self.exec.write_file(&path, selections, Some(0o600))?;
            record.package_snapshot = Some(PathBuf::from(PACKAGES_FILE));
        }

        record.save(self.exec)?;
        log::info!(
            "Restore point holds {} files from {} of {} paths",
            record.file_count(),
            record.copied_sources().len(),
            record.sources.len()
        );
        Ok(record)
    }

    /// Copy each backed-up object back to its original location.
    pub fn restore(&self, record: &BackupRecord) -> RestoreReport {
        let mut report = RestoreReport::default();
        report.skipped.extend(record.missing.iter().cloned());

        for entry in &record.entries {
            let stored = record.stored_path(&entry.source);
            if !matches!(self.exec.stat(&stored), Ok(Some(_))) {
                log::warn!("Backup copy of {} is gone, skipping", entry.source.display());
                report.skipped.push(entry.source.clone());
                continue;
            }
            match self.restore_entry(entry, &stored) {
                Ok(()) => {
                    if !self.exec.is_dry_run() {
                        log::info!("Restored {}", entry.source.display());
                    }
                    report.restored.push(entry.source.clone());
                }
                Err(e) => {
                    log::error!("Failed to restore {}: {e}", entry.source.display());
                    report.failed.push((entry.source.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Load the restore point in `dir`.
    pub fn load(&self, dir: &Path) -> Result<BackupRecord> {
        BackupRecord::load(self.exec, dir)
    }

    /// All restore points, oldest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        if !self.exec.exists(&self.root) {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for path in self.exec.list_dir(&self.root)? {
            if !self.exec.exists(&path.join(MANIFEST_FILE)) {
                continue;
            }
            match self.load(&path) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Ignoring unreadable restore point: {e}"),
            }
        }
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.destination.cmp(&b.destination))
        });
        Ok(records)
    }

    /// The newest restore point.
    pub fn latest(&self) -> Result<BackupRecord> {
        self.list()?
            .pop()
            .ok_or_else(|| Error::NoRestorePoints(self.root.clone()))
    }

    /// Create `<root>/<stamp>`, adding `-N` if that name is taken.
    fn claim_directory(&self, stamp: &str) -> Result<PathBuf> {
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                stamp.to_string()
            } else {
                format!("{stamp}-{attempt}")
            };
            let path = self.root.join(name);
            if !self.exec.exists(&path) {
                self.exec.create_dir_all(&path)?;
                return Ok(path);
            }
            attempt += 1;
        }
    }

    /// Copy one source path (recursively) into the restore point.
    fn copy_tree(
        &self,
        path: &Path,
        stat: FileStat,
        record: &BackupRecord,
        entries: &mut Vec<BackupEntry>,
    ) -> Result<()> {
        let dest = record.stored_path(path);
        match stat.kind {
            FileKind::Dir => {
                self.exec.create_dir_all(&dest)?;
                entries.push(BackupEntry {
                    source: path.to_path_buf(),
                    kind: EntryKind::Dir,
                    digest: None,
                    target: None,
                    mode: None,
                });
                for child in self.exec.list_dir(path)? {
                    if let Some(stat) = self.exec.stat(&child)? {
                        self.copy_tree(&child, stat, record, entries)?;
                    }
                }
            }
            FileKind::Symlink => {
                let target = self.exec.read_link(path)?;
                self.exec.symlink(&target, &dest)?;
                entries.push(BackupEntry {
                    source: path.to_path_buf(),
                    kind: EntryKind::Symlink,
                    digest: None,
                    target: Some(target),
                    mode: None,
                });
            }
            FileKind::File => {
                let Some(content) = self.exec.read_bytes(path)? else {
                    log::warn!("{} vanished during backup, skipping", path.display());
                    return Ok(());
                };
                self.exec.write_bytes(&dest, &content, Some(stat.mode))?;
                entries.push(BackupEntry {
                    source: path.to_path_buf(),
                    kind: EntryKind::File,
                    digest: Some(digest(&content)),
                    target: None,
                    mode: Some(stat.mode),
                });
            }
        }
        Ok(())
    }

    fn restore_entry(&self, entry: &BackupEntry, stored: &Path) -> Result<()> {
        let target = &entry.source;
        match entry.kind {
            EntryKind::Dir => self.exec.create_dir_all(target)?,
            EntryKind::Symlink => {
                let link = self.exec.read_link(stored)?;
                self.exec.symlink(&link, target)?;
            }
            EntryKind::File => {
                let content = self
                    .exec
                    .read_bytes(stored)?
                    .ok_or_else(|| Error::MissingCopy(stored.to_path_buf()))?;
                if let Some(expected) = &entry.digest
                    && *expected != digest(&content)
                {
                    return Err(Error::Tampered(stored.to_path_buf()));
                }
                self.exec.write_bytes(target, &content, entry.mode)?;
            }
        }
        Ok(())
    }
}

fn digest(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use syscmd::backend::scripted::{Call, ScriptedBackend};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        host: PathBuf,
        backups: PathBuf,
        exec: Executor,
    }

    impl Fixture {
        fn manager(&self) -> BackupManager<'_> {
            BackupManager::new(&self.exec, &self.backups)
        }
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host");
        fs::create_dir_all(host.join("etc/ssh")).unwrap();
        let backups = temp.path().join("backups");
        Fixture {
            _temp: temp,
            host,
            backups,
            exec: Executor::system(),
        }
    }

    #[test]
    fn test_two_of_five_paths_exist() {
        let f = fixture();
        fs::write(f.host.join("etc/ssh/sshd_config"), "Port 22\n").unwrap();
        fs::write(f.host.join("etc/sysctl.conf"), "vm.swappiness=60\n").unwrap();
        let sources = vec![
            f.host.join("etc/ssh/sshd_config"),
            f.host.join("etc/docker/daemon.json"),
            f.host.join("etc/sysctl.conf"),
            f.host.join("etc/netplan"),
            f.host.join("etc/security/limits.conf"),
        ];

        let record = f.manager().create_restore_point(&sources, None).unwrap();

        assert_eq!(record.copied_sources().len(), 2);
        assert_eq!(record.missing.len(), 3);
        assert_eq!(record.file_count(), 2);
        assert_eq!(
            fs::read_to_string(record.stored_path(&sources[0])).unwrap(),
            "Port 22\n"
        );
        assert!(record.destination.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_directories_copied_recursively() {
        let f = fixture();
        let netplan = f.host.join("etc/netplan");
        fs::create_dir_all(&netplan).unwrap();
        fs::write(netplan.join("01-network-manager-all.yaml"), "network: {}\n").unwrap();
        fs::write(netplan.join("50-cloud-init.yaml"), "network: {version: 2}\n").unwrap();

        let record = f
            .manager()
            .create_restore_point(&[netplan.clone()], None)
            .unwrap();
        assert_eq!(record.file_count(), 2);
        assert_eq!(record.entries[0].kind, EntryKind::Dir);
        assert!(
            record
                .stored_path(&netplan.join("50-cloud-init.yaml"))
                .exists()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_preserved() {
        let f = fixture();
        let link = f.host.join("etc/resolv.conf");
        std::os::unix::fs::symlink("../run/systemd/resolve/stub-resolv.conf", &link).unwrap();

        let record = f.manager().create_restore_point(&[link.clone()], None).unwrap();
        let stored = record.stored_path(&link);
        assert!(fs::symlink_metadata(&stored).unwrap().file_type().is_symlink());
        assert_eq!(record.entries[0].kind, EntryKind::Symlink);
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let secret = f.host.join("etc/ssh/ssh_host_ed25519_key");
        fs::write(&secret, "key\n").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
        let record = f.manager().create_restore_point(&[secret.clone()], None).unwrap();

        fs::remove_file(&secret).unwrap();
        assert!(f.manager().restore(&record).is_success());
        let mode = fs::metadata(&secret).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_package_snapshot_written() {
        let f = fixture();
        let record = f
            .manager()
            .create_restore_point(&[], Some("bash\tinstall\n"))
            .unwrap();
        let snapshot = record.destination.join(record.package_snapshot.as_ref().unwrap());
        assert_eq!(fs::read_to_string(snapshot).unwrap(), "bash\tinstall\n");
    }

    #[test]
    fn test_same_second_gets_suffix() {
        let f = fixture();
        let first = f.manager().claim_directory("20260101-000000").unwrap();
        let second = f.manager().claim_directory("20260101-000000").unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1"));
    }

    #[test]
    fn test_restore_copies_back_and_skips_missing() {
        let f = fixture();
        let config = f.host.join("etc/ssh/sshd_config");
        fs::write(&config, "Port 22\n").unwrap();
        let absent = f.host.join("etc/docker/daemon.json");
        let record = f
            .manager()
            .create_restore_point(&[config.clone(), absent.clone()], None)
            .unwrap();

        fs::write(&config, "Port 2222\n").unwrap();
        let report = f.manager().restore(&record);

        assert!(report.is_success());
        assert_eq!(report.restored, vec![config.clone()]);
        assert_eq!(report.skipped, vec![absent]);
        assert_eq!(fs::read_to_string(&config).unwrap(), "Port 22\n");
    }

    #[test]
    fn test_restore_dry_run_writes_nothing() {
        let f = fixture();
        let config = f.host.join("etc/sysctl.conf");
        fs::write(&config, "a=1\n").unwrap();
        let record = f
            .manager()
            .create_restore_point(&[config.clone()], None)
            .unwrap();
        fs::write(&config, "a=2\n").unwrap();

        let exec = Executor::system().dry_run(true);
        let report = BackupManager::new(&exec, &f.backups).restore(&record);
        assert_eq!(report.restored.len(), 1);
        assert_eq!(fs::read_to_string(&config).unwrap(), "a=2\n");
        assert_eq!(exec.take_planned().len(), 1);
    }

    #[test]
    fn test_restore_rejects_tampered_copy() {
        let f = fixture();
        let config = f.host.join("etc/sysctl.conf");
        fs::write(&config, "a=1\n").unwrap();
        let record = f
            .manager()
            .create_restore_point(&[config.clone()], None)
            .unwrap();
        fs::write(record.stored_path(&config), "tampered\n").unwrap();

        let report = f.manager().restore(&record);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(fs::read_to_string(&config).unwrap(), "a=1\n");
    }

    #[test]
    fn test_list_and_latest() {
        let f = fixture();
        let manager = f.manager();
        assert!(matches!(manager.latest(), Err(Error::NoRestorePoints(_))));

        let first = manager.create_restore_point(&[], None).unwrap();
        let second = manager.create_restore_point(&[], None).unwrap();
        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);

        let latest = manager.latest().unwrap();
        assert_eq!(latest.destination, second.destination);
        assert_ne!(latest.destination, first.destination);
        assert_eq!(manager.load(&first.destination).unwrap().destination, first.destination);
    }

    #[test]
    fn test_writes_go_through_the_executor() {
        let backend = ScriptedBackend::new();
        backend
            .with_file("/etc/netplan/01-netcfg.yaml", "network: {}\n")
            .with_symlink("/etc/resolv.conf", "../run/systemd/resolve/stub-resolv.conf");
        let exec = Executor::new(Box::new(backend.clone()));
        let manager = BackupManager::new(&exec, "/var/backups/gpuhost");

        let record = manager
            .create_restore_point(
                &[PathBuf::from("/etc/netplan"), PathBuf::from("/etc/resolv.conf")],
                Some("bash\tinstall\n"),
            )
            .unwrap();

        let stored = record.stored_path(Path::new("/etc/netplan/01-netcfg.yaml"));
        assert_eq!(backend.file(&stored).as_deref(), Some("network: {}\n"));
        assert_eq!(
            backend.link(record.stored_path(Path::new("/etc/resolv.conf"))),
            Some(PathBuf::from("../run/systemd/resolve/stub-resolv.conf"))
        );
        let mutations = backend.mutations();
        assert!(mutations.contains(&Call::Write(stored)));
        assert!(mutations.contains(&Call::Write(record.destination.join(MANIFEST_FILE))));
        assert_eq!(manager.latest().unwrap().entries, record.entries);
    }

    #[test]
    fn test_dry_run_backup_only_plans() {
        let backend = ScriptedBackend::new();
        backend.with_file("/etc/sysctl.conf", "vm.swappiness=60\n");
        let exec = Executor::new(Box::new(backend.clone())).dry_run(true);

        let record = BackupManager::new(&exec, "/var/backups/gpuhost")
            .create_restore_point(&[PathBuf::from("/etc/sysctl.conf")], Some(""))
            .unwrap();

        assert_eq!(record.file_count(), 1);
        assert!(backend.mutations().is_empty());
        let planned: Vec<String> = exec.take_planned().iter().map(ToString::to_string).collect();
        assert!(planned.iter().any(|a| a.contains("files/etc/sysctl.conf")));
        assert!(planned.iter().any(|a| a.contains(MANIFEST_FILE)));
    }
}

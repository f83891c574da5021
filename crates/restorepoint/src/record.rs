//! Restore point manifest

use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use syscmd::Executor;
use std::path::{Component, Path, PathBuf};

/// Manifest file name inside every restore point directory.
pub const MANIFEST_FILE: &str = "manifest.toml";
/// Package selection snapshot file name.
pub const PACKAGES_FILE: &str = "package-selections.txt";
/// Subdirectory holding the mirrored files.
pub const FILES_DIR: &str = "files";

/// What kind of filesystem object an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One copied filesystem object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Original absolute location
    pub source: PathBuf,
    pub kind: EntryKind,
    /// blake3 digest of the content (regular files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Link target (symlinks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Permission bits (regular files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// A restore point: what was requested, what was copied, where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub timestamp: DateTime<Local>,
    /// Requested paths, in order
    pub sources: Vec<PathBuf>,
    /// Requested paths that did not exist
    #[serde(default)]
    pub missing: Vec<PathBuf>,
    /// Every copied object, parents before children
    #[serde(default)]
    pub entries: Vec<BackupEntry>,
    /// Set when a package selection snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_snapshot: Option<PathBuf>,
    /// Directory holding this restore point (not serialized)
    #[serde(skip)]
    pub destination: PathBuf,
}

impl BackupRecord {
    /// Load the manifest of a restore point directory.
    pub fn load(exec: &Executor, dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let Some(content) = exec.read_to_string(&path)? else {
            return Err(Error::NotARestorePoint(dir.to_path_buf()));
        };
        let mut record: Self =
            toml::from_str(&content).map_err(|source| Error::Manifest { path, source })?;
        record.destination = dir.to_path_buf();
        Ok(record)
    }

    /// Write the manifest into the restore point directory.
    pub fn save(&self, exec: &Executor) -> Result<()> {
        let path = self.destination.join(MANIFEST_FILE);
        let content = toml::to_string_pretty(self)?;
        exec.write_file(&path, &content, Some(0o600))?;
        Ok(())
    }

    /// Where the copy of `source` lives inside this restore point.
    pub fn stored_path(&self, source: &Path) -> PathBuf {
        self.destination.join(FILES_DIR).join(mirror(source))
    }

    /// Requested paths that were actually copied.
    pub fn copied_sources(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| !self.missing.contains(s))
            .map(PathBuf::as_path)
            .collect()
    }

    /// Number of regular files captured.
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count()
    }
}

/// Turn an absolute path into a relative one that mirrors it.
pub(crate) fn mirror(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

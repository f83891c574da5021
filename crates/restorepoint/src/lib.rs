//! # restorepoint
//!
//! Dated restore points taken before a provisioning run mutates the host.
//!
//! A restore point is a directory `<root>/<YYYYmmdd-HHMMSS>` holding:
//! - `files/`, mirroring each backed-up absolute path
//! - `package-selections.txt`, the `dpkg --get-selections` output
//! - `manifest.toml`, the [`BackupRecord`] with blake3 digests
//!
//! Every read and write goes through a [`syscmd::Executor`], so a dry-run
//! executor only plans the copies. Restore points are never deleted
//! automatically.

pub mod error;
pub mod manager;
pub mod record;

pub use error::{Error, Result};
pub use manager::{BackupManager, RestoreReport};
pub use record::{BackupEntry, BackupRecord, EntryKind, MANIFEST_FILE, PACKAGES_FILE};

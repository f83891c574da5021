//! Backend abstraction for host operations.
//!
//! The [`Backend`] trait is the only place where processes are spawned or
//! host files are touched, allowing for different implementations:
//! - [`system::SystemBackend`] runs real commands against the real filesystem
//! - [`scripted::ScriptedBackend`] simulates a host in memory for tests

pub mod scripted;
pub mod system;

use crate::error::Result;
use crate::types::{CommandOutput, CommandSpec, FileStat};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Why a command is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Read-only inspection of system state
    Query,
    /// A command that changes the system
    Mutate,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => f.write_str("query"),
            Self::Mutate => f.write_str("mutate"),
        }
    }
}

/// Backend trait for host operations.
pub trait Backend {
    /// Run a command to completion, killing it after `timeout`.
    ///
    /// A non-zero exit is not an error here; it is reported in the output.
    /// Only failure to start the program is an `Err`.
    fn execute(
        &self,
        spec: &CommandSpec,
        intent: Intent,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;

    /// Read a file, returning `None` if it does not exist.
    fn read_to_string(&self, path: &Path) -> Result<Option<String>>;

    /// Read a file's raw bytes, returning `None` if it does not exist.
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Kind and mode of `path` without following a final symlink.
    fn stat(&self, path: &Path) -> Result<Option<FileStat>>;

    /// Entries of a directory, sorted.
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Where a symlink points.
    fn read_link(&self, path: &Path) -> Result<PathBuf>;

    /// Check whether a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Write a file atomically, creating parent directories as needed.
    fn write_file(&self, path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()>;

    /// Remove a file. Removing a missing file is not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Create a directory and all of its parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Rename a file or directory.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Create `link` pointing at `target`, replacing a file or link already there.
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
}

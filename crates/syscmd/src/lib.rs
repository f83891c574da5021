//! # syscmd
//!
//! The command boundary for host provisioning.
//!
//! Every external mutation (running a program, writing a file) goes through an
//! [`Executor`], which gives three guarantees uniformly:
//! - dry-run: mutations are never executed, only recorded as [`PlannedAction`]s
//! - timeouts: every command is killed after a configurable limit
//! - logging: every command is logged through the `log` facade
//!
//! Read-only inspection uses the `probe` family, which executes even in
//! dry-run mode because it cannot change the host.
//!
//! ## Example
//!
//! ```no_run
//! use syscmd::{Executor, apt::Apt};
//! use std::time::Duration;
//!
//! let exec = Executor::system()
//!     .dry_run(true)
//!     .with_timeout(Some(Duration::from_secs(600)));
//!
//! let apt = Apt::new(&exec);
//! let installed = apt.install(&["jq", "curl"]).expect("install failed");
//! for action in exec.take_planned() {
//!     println!("{action}");
//! }
//! # let _ = installed;
//! ```
//!
//! ## Testing
//!
//! [`backend::scripted::ScriptedBackend`] simulates a host in memory (files,
//! dpkg database, scripted command output) and records every call.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apt;
pub mod backend;
pub mod error;
pub mod systemd;
pub mod types;

pub use error::{Error, ErrorCategory, Result};
pub use types::{CommandOutput, CommandSpec, FileKind, FileStat, PlannedAction};

use backend::{Backend, Intent, system::SystemBackend};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runs commands and file operations against a [`Backend`].
pub struct Executor {
    backend: Box<dyn Backend>,
    dry_run: bool,
    default_timeout: Option<Duration>,
    planned: RefCell<Vec<PlannedAction>>,
}

impl Executor {
    /// Create an executor over a custom backend (useful for testing).
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            dry_run: false,
            default_timeout: None,
            planned: RefCell::new(Vec::new()),
        }
    }

    /// Create an executor that runs real commands on this host.
    pub fn system() -> Self {
        Self::new(Box::new(SystemBackend::new()))
    }

    /// Enable or disable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the default timeout applied to every command.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Whether mutations are being intercepted.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Run a mutating command and return its output, whatever the exit code.
    ///
    /// In dry-run mode nothing is executed and a synthetic success is returned.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_spec(CommandSpec::new(program).args(args))
    }

    /// Run a mutating command described by a [`CommandSpec`].
    pub fn run_spec(&self, spec: CommandSpec) -> Result<CommandOutput> {
        if self.dry_run {
            log::info!("[dry-run] would run: {spec}");
            self.plan(PlannedAction::Run(spec.display()));
            return Ok(CommandOutput::ok(""));
        }

        log::info!("Running: {spec}");
        let timeout = spec.timeout.or(self.default_timeout);
        self.backend.execute(&spec, Intent::Mutate, timeout)
    }

    /// Run a mutating command, failing on non-zero exit or timeout.
    pub fn run_or_fail(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_spec_or_fail(CommandSpec::new(program).args(args))
    }

    /// [`Self::run_or_fail`] for a [`CommandSpec`].
    pub fn run_spec_or_fail(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let command = spec.display();
        let output = self.run_spec(spec)?;
        check(command, output)
    }

    /// Write a file, replacing any existing content.
    pub fn write_file(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<()> {
        self.write_bytes(path, contents.as_bytes(), mode)
    }

    /// [`Self::write_file`] for binary content.
    pub fn write_bytes(&self, path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
        if self.dry_run {
            log::info!("[dry-run] would write {}", path.display());
            self.plan(PlannedAction::Write {
                path: path.to_path_buf(),
                bytes: contents.len(),
            });
            return Ok(());
        }
        log::info!("Writing {}", path.display());
        self.backend.write_file(path, contents, mode)
    }

    /// Remove a file if it exists.
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            log::info!("[dry-run] would remove {}", path.display());
            self.plan(PlannedAction::Remove(path.to_path_buf()));
            return Ok(());
        }
        log::info!("Removing {}", path.display());
        self.backend.remove_file(path)
    }

    /// Create a directory and its parents.
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            self.plan(PlannedAction::CreateDir(path.to_path_buf()));
            return Ok(());
        }
        self.backend.create_dir_all(path)
    }

    /// Move a file or directory.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if self.dry_run {
            log::info!(
                "[dry-run] would move {} to {}",
                from.display(),
                to.display()
            );
            self.plan(PlannedAction::Rename {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            });
            return Ok(());
        }
        log::info!("Moving {} to {}", from.display(), to.display());
        self.backend.rename(from, to)
    }

    /// Point `link` at `target`, replacing whatever is at `link`.
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        if self.dry_run {
            log::info!(
                "[dry-run] would link {} -> {}",
                link.display(),
                target.display()
            );
            self.plan(PlannedAction::Symlink {
                target: target.to_path_buf(),
                link: link.to_path_buf(),
            });
            return Ok(());
        }
        log::debug!("Linking {} -> {}", link.display(), target.display());
        self.backend.symlink(target, link)
    }

    // =========================================================================
    // Queries (always executed)
    // =========================================================================

    /// Run a read-only command and return its output, whatever the exit code.
    pub fn probe(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.probe_spec(&CommandSpec::new(program).args(args))
    }

    /// [`Self::probe`] for a [`CommandSpec`].
    pub fn probe_spec(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        log::debug!("Probing: {spec}");
        let timeout = spec.timeout.or(self.default_timeout);
        self.backend.execute(spec, Intent::Query, timeout)
    }

    /// Run a read-only command and report only whether it succeeded.
    pub fn probe_ok(&self, program: &str, args: &[&str]) -> bool {
        self.probe(program, args).is_ok_and(|o| o.success())
    }

    /// Run a read-only command and return trimmed stdout, failing on non-zero exit.
    pub fn probe_stdout(&self, program: &str, args: &[&str]) -> Result<String> {
        let spec = CommandSpec::new(program).args(args);
        let command = spec.display();
        let output = check(command, self.probe_spec(&spec)?)?;
        Ok(output.stdout_trimmed().to_string())
    }

    /// Check if a program is available on `$PATH`.
    pub fn command_exists(&self, program: &str) -> bool {
        self.probe_ok("sh", &["-c", &format!("command -v {program}")])
    }

    /// Read a file, returning `None` if it does not exist.
    pub fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        self.backend.read_to_string(path)
    }

    /// Read a file's raw bytes, returning `None` if it does not exist.
    pub fn read_bytes(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        self.backend.read(path)
    }

    /// Kind and mode of a path, `None` if nothing is there. Symlinks are not followed.
    pub fn stat(&self, path: &Path) -> Result<Option<FileStat>> {
        self.backend.stat(path)
    }

    /// Entries of a directory, sorted.
    pub fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.backend.list_dir(path)
    }

    /// Where a symlink points.
    pub fn read_link(&self, path: &Path) -> Result<PathBuf> {
        self.backend.read_link(path)
    }

    /// Check whether a path exists.
    pub fn exists(&self, path: &Path) -> bool {
        self.backend.exists(path)
    }

    // =========================================================================
    // Dry-run journal
    // =========================================================================

    fn plan(&self, action: PlannedAction) {
        self.planned.borrow_mut().push(action);
    }

    /// Drain the actions recorded in dry-run mode since the last call.
    pub fn take_planned(&self) -> Vec<PlannedAction> {
        std::mem::take(&mut *self.planned.borrow_mut())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("dry_run", &self.dry_run)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

fn check(command: String, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    Err(Error::ExternalCommand {
        command,
        exit_code: output.exit_code,
        stderr: output.stderr_trimmed().to_string(),
        timed_out: output.timed_out,
    })
}

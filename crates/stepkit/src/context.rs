//! Step context and callback traits
//!
//! These traits keep the runner independent of any particular terminal UI.

use crate::config::RunConfig;
use crate::types::StepReport;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use syscmd::Executor;

/// Confirmation callback for user interaction
///
/// Implement this trait to handle user confirmations.
pub trait ConfirmCallback {
    /// Ask the user to confirm an action
    ///
    /// # Returns
    /// `true` if the user confirmed, `false` otherwise
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Observer for run progress
///
/// Implement this trait to receive progress updates during a run.
pub trait RunObserver {
    /// Called once before the first step
    fn on_run_start(&mut self, _total: usize) {}

    /// Called when a step is about to be evaluated
    fn on_step_start(&mut self, index: usize, total: usize, name: &str, description: &str);

    /// Called when a step has an outcome
    fn on_step_complete(&mut self, report: &StepReport);

    /// Called when a step fails, before the run aborts
    fn on_step_failed(&mut self, _name: &str, _error: &anyhow::Error) {}
}

/// No-op observer
pub struct NoObserver;

impl RunObserver for NoObserver {
    fn on_step_start(&mut self, _index: usize, _total: usize, _name: &str, _description: &str) {}
    fn on_step_complete(&mut self, _report: &StepReport) {}
}

/// Shared interruption flag checked at step boundaries.
#[derive(Debug, Clone, Copy)]
pub struct CancelFlag<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CancelFlag<'a> {
    /// Wrap an atomic flag (typically one set by a signal handler).
    pub fn new(flag: &'a AtomicBool) -> Self {
        Self { flag }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Context passed to every step operation
pub struct StepContext<'a> {
    /// Options for this run
    pub config: &'a RunConfig,
    /// Command boundary; all host access goes through it
    pub exec: &'a Executor,
    confirmer: &'a mut dyn ConfirmCallback,
    restore_point: Option<PathBuf>,
}

impl<'a> StepContext<'a> {
    /// Create a new step context
    pub fn new(
        config: &'a RunConfig,
        exec: &'a Executor,
        confirmer: &'a mut dyn ConfirmCallback,
    ) -> Self {
        Self {
            config,
            exec,
            confirmer,
            restore_point: None,
        }
    }

    /// Whether this is a dry run
    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Record the restore point created by a backup step
    pub fn set_restore_point(&mut self, path: PathBuf) {
        self.restore_point = Some(path);
    }

    /// The restore point created earlier in this run, if any
    pub fn restore_point(&self) -> Option<&Path> {
        self.restore_point.as_deref()
    }

    /// Ask for confirmation; dry runs proceed without prompting
    pub fn confirm(&mut self, prompt: &str) -> Result<bool> {
        if self.config.dry_run {
            return Ok(true);
        }
        self.confirmer.confirm(prompt)
    }
}

//! Core types for step execution

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What a step's precondition found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Apply is needed
    Ready,
    /// The system is already in the state the step produces
    AlreadySatisfied(String),
    /// The step has nothing to act on here (e.g. no GPU present)
    NotApplicable(String),
}

/// Result of a step's apply action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// The host was changed
    Changed(String),
    /// The step ran but nothing needed changing
    Unchanged(String),
}

/// How a step ended, as seen by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Apply changed the host
    Changed { summary: String },
    /// The step ran, or its precondition found the work already done
    NoChange { reason: String },
    /// Nothing to do on this machine; not a skip, not a failure
    NothingToDo { reason: String },
    /// Named in the skip set; never invoked
    Skipped,
    /// Dry-run: the mutations the step would have made
    DryRun { actions: Vec<String> },
    /// Failed while continue-on-error was set
    Failed { error: String },
}

impl StepOutcome {
    /// Whether the step counts as executed for flow purposes.
    pub fn is_executed(&self) -> bool {
        !matches!(self, Self::Skipped | Self::Failed { .. })
    }

    /// Whether the step failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short label for display and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Changed { .. } => "changed",
            Self::NoChange { .. } => "no change",
            Self::NothingToDo { .. } => "nothing to do",
            Self::Skipped => "skipped",
            Self::DryRun { .. } => "dry-run",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Record of one step in a run.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: &'static str,
    pub description: String,
    pub outcome: StepOutcome,
    pub duration: Duration,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub steps: Vec<StepReport>,
    /// The finalizer's report, if it ran
    pub finalizer: Option<StepReport>,
    /// Restore point created during the run, if any
    pub restore_point: Option<PathBuf>,
}

impl RunSummary {
    fn count(&self, pred: impl Fn(&StepOutcome) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(&s.outcome)).count()
    }

    /// Steps that changed the host.
    pub fn changed(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Changed { .. }))
    }

    /// Steps that found nothing to change.
    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::NoChange { .. }))
    }

    /// Steps with nothing to act on.
    pub fn nothing_to_do(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::NothingToDo { .. }))
    }

    /// Steps skipped by request.
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Skipped))
    }

    /// Steps that failed (continue-on-error only).
    pub fn failed(&self) -> usize {
        self.count(StepOutcome::is_failure)
    }

    /// Check if the run was fully successful.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// Names of steps that executed successfully.
    pub fn completed(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|s| s.outcome.is_executed())
            .map(|s| s.name)
            .collect()
    }

    /// Look up a step's report by name.
    pub fn get(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

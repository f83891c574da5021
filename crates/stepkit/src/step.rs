//! The Step trait

use crate::context::StepContext;
use crate::types::{ApplyResult, Readiness};
use anyhow::Result;

/// A single named provisioning step.
///
/// Steps are evaluated in three phases: `precondition` decides whether work
/// is needed, `apply` performs it through the context's executor, and
/// `postcondition` confirms the result. In dry-run mode `apply` still runs;
/// the executor intercepts its mutations and the runner reports them.
pub trait Step {
    /// Stable name used for `--skip` and logs (e.g. "docker")
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> String;

    /// Whether the user may skip this step
    fn skippable(&self) -> bool {
        true
    }

    /// Check whether apply is needed
    fn precondition(&self, _ctx: &StepContext) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }

    /// Perform the step
    fn apply(&self, ctx: &mut StepContext) -> Result<ApplyResult>;

    /// Confirm the step had its effect (not evaluated in dry-run)
    fn postcondition(&self, _ctx: &StepContext) -> Result<bool> {
        Ok(true)
    }
}

//! # stepkit
//!
//! Ordered provisioning steps with skip, dry-run and fail-fast semantics.
//!
//! ## Core Concepts
//!
//! - **Step**: a named unit of host configuration with a precondition, an
//!   apply action and a postcondition
//! - **StepContext**: run options plus the [`syscmd::Executor`] every step
//!   must use for host access
//! - **Runner**: executes steps strictly in order, stopping at the first
//!   failure and naming the restore point
//!
//! ## Example
//!
//! ```ignore
//! use stepkit::{ApplyResult, Step, StepContext, Runner, RunConfig};
//!
//! struct Motd;
//!
//! impl Step for Motd {
//!     fn name(&self) -> &'static str { "motd" }
//!     fn description(&self) -> String { "Write /etc/motd".into() }
//!
//!     fn apply(&self, ctx: &mut StepContext) -> anyhow::Result<ApplyResult> {
//!         ctx.exec.write_file("/etc/motd".as_ref(), "managed\n", Some(0o644))?;
//!         Ok(ApplyResult::Changed("motd written".into()))
//!     }
//! }
//!
//! let runner = Runner::new(vec![Box::new(Motd)])?;
//! let summary = runner.execute(&mut ctx, &mut NoObserver, cancel)?;
//! ```

pub mod config;
pub mod context;
pub mod runner;
pub mod step;
pub mod types;

pub use config::RunConfig;
pub use context::{
    AutoConfirm, AutoDecline, CancelFlag, ConfirmCallback, NoObserver, RunObserver, StepContext,
};
pub use runner::{PostconditionFailed, RunError, Runner};
pub use step::Step;
pub use types::{ApplyResult, Readiness, RunSummary, StepOutcome, StepReport};

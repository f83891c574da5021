//! Ordered, fail-fast step execution

use crate::config::RunConfig;
use crate::context::{CancelFlag, RunObserver, StepContext};
use crate::step::Step;
use crate::types::{ApplyResult, Readiness, RunSummary, StepOutcome, StepReport};
use anyhow::Context;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("duplicate step name '{0}'")]
    DuplicateStep(&'static str),

    #[error("cannot skip '{name}': {reason}")]
    InvalidSkip { name: String, reason: String },

    #[error("step '{step}' failed")]
    StepFailed {
        step: &'static str,
        #[source]
        source: anyhow::Error,
        restore_point: Option<PathBuf>,
        completed: Vec<&'static str>,
    },

    #[error("interrupted{}", after.map(|s| format!(" after step '{s}'")).unwrap_or_default())]
    Interrupted {
        after: Option<&'static str>,
        restore_point: Option<PathBuf>,
        completed: Vec<&'static str>,
    },

    #[error("{} step(s) failed: {}", failed.len(), failed.join(", "))]
    Incomplete {
        failed: Vec<&'static str>,
        restore_point: Option<PathBuf>,
        completed: Vec<&'static str>,
    },
}

impl RunError {
    /// The restore point to point the operator at, if one was created.
    pub fn restore_point(&self) -> Option<&Path> {
        match self {
            Self::StepFailed { restore_point, .. }
            | Self::Interrupted { restore_point, .. }
            | Self::Incomplete { restore_point, .. } => restore_point.as_deref(),
            Self::DuplicateStep(_) | Self::InvalidSkip { .. } => None,
        }
    }

    /// Steps that finished before the run stopped.
    pub fn completed(&self) -> &[&'static str] {
        match self {
            Self::StepFailed { completed, .. }
            | Self::Interrupted { completed, .. }
            | Self::Incomplete { completed, .. } => completed,
            Self::DuplicateStep(_) | Self::InvalidSkip { .. } => &[],
        }
    }
}

/// A step applied cleanly but its postcondition did not hold.
#[derive(Debug, thiserror::Error)]
#[error("postcondition not met after applying '{step}'")]
pub struct PostconditionFailed {
    pub step: &'static str,
}

/// Executes a fixed sequence of steps.
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
    finalizer: Option<Box<dyn Step>>,
}

impl Runner {
    /// Create a runner, rejecting duplicate step names.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self, RunError> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.name()) {
                return Err(RunError::DuplicateStep(step.name()));
            }
        }
        Ok(Self {
            steps,
            finalizer: None,
        })
    }

    /// Add a step that runs only after every step succeeded.
    pub fn with_finalizer(mut self, step: Box<dyn Step>) -> Self {
        self.finalizer = Some(step);
        self
    }

    /// Steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &dyn Step> {
        self.steps.iter().map(AsRef::as_ref)
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Reject skip entries that name unknown or mandatory steps.
    pub fn validate_skips(&self, config: &RunConfig) -> Result<(), RunError> {
        for name in &config.skip {
            match self.steps.iter().find(|s| s.name() == name) {
                None => {
                    return Err(RunError::InvalidSkip {
                        name: name.clone(),
                        reason: format!("unknown step (known: {})", self.step_names().join(", ")),
                    });
                }
                Some(step) if !step.skippable() => {
                    return Err(RunError::InvalidSkip {
                        name: name.clone(),
                        reason: "this step is required".to_string(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Run every step in order.
    ///
    /// Stops at the first failure unless `continue_on_error` is set, and at
    /// the next step boundary once `cancel` is raised.
    pub fn execute(
        &self,
        ctx: &mut StepContext,
        observer: &mut dyn RunObserver,
        cancel: CancelFlag,
    ) -> Result<RunSummary, RunError> {
        self.validate_skips(ctx.config)?;

        let total = self.steps.len();
        let mut summary = RunSummary::default();
        let mut failed = Vec::new();
        observer.on_run_start(total);
        log::info!(
            "Starting run of {total} steps{}",
            if ctx.is_dry_run() { " (dry-run)" } else { "" }
        );

        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(interrupted(&summary, ctx));
            }

            let name = step.name();
            let description = step.description();
            observer.on_step_start(index + 1, total, name, &description);
            let started = Instant::now();

            let outcome = if ctx.config.is_skipped(name) {
                StepOutcome::Skipped
            } else {
                log::info!("Step {}/{total} {name}: {description}", index + 1);
                match run_step(step.as_ref(), ctx) {
                    Ok(outcome) => outcome,
                    Err(source) => {
                        report_failure(name, &source, ctx.restore_point());
                        observer.on_step_failed(name, &source);
                        if !ctx.config.continue_on_error {
                            return Err(RunError::StepFailed {
                                step: name,
                                source,
                                restore_point: ctx.restore_point().map(Path::to_path_buf),
                                completed: summary.completed(),
                            });
                        }
                        failed.push(name);
                        StepOutcome::Failed {
                            error: format!("{source:#}"),
                        }
                    }
                }
            };

            log::info!("Step {name}: {}", outcome.label());
            let report = StepReport {
                name,
                description,
                outcome,
                duration: started.elapsed(),
            };
            observer.on_step_complete(&report);
            summary.steps.push(report);
        }

        summary.restore_point = ctx.restore_point().map(Path::to_path_buf);

        if !failed.is_empty() {
            return Err(RunError::Incomplete {
                failed,
                restore_point: summary.restore_point.clone(),
                completed: summary.completed(),
            });
        }

        if let Some(finalizer) = &self.finalizer {
            if cancel.is_cancelled() {
                return Err(interrupted(&summary, ctx));
            }
            let name = finalizer.name();
            let description = finalizer.description();
            observer.on_step_start(total, total, name, &description);
            let started = Instant::now();
            let outcome = run_step(finalizer.as_ref(), ctx).map_err(|source| {
                report_failure(name, &source, ctx.restore_point());
                observer.on_step_failed(name, &source);
                RunError::StepFailed {
                    step: name,
                    source,
                    restore_point: ctx.restore_point().map(Path::to_path_buf),
                    completed: summary.completed(),
                }
            })?;
            let report = StepReport {
                name,
                description,
                outcome,
                duration: started.elapsed(),
            };
            observer.on_step_complete(&report);
            summary.finalizer = Some(report);
        }

        log::info!(
            "Run complete: {} changed, {} unchanged, {} nothing to do, {} skipped",
            summary.changed(),
            summary.unchanged(),
            summary.nothing_to_do(),
            summary.skipped()
        );
        Ok(summary)
    }
}

/// Evaluate one step: precondition, apply, postcondition.
fn run_step(step: &dyn Step, ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
    let name = step.name();
    // Anything left over belongs to a previous step.
    drop(ctx.exec.take_planned());

    match step
        .precondition(ctx)
        .with_context(|| format!("checking whether '{name}' is needed"))?
    {
        Readiness::AlreadySatisfied(reason) => {
            log::info!("Step {name}: already satisfied ({reason})");
            return Ok(StepOutcome::NoChange { reason });
        }
        Readiness::NotApplicable(reason) => {
            log::info!("Step {name}: nothing to do ({reason})");
            return Ok(StepOutcome::NothingToDo { reason });
        }
        Readiness::Ready => {}
    }

    let result = step.apply(ctx)?;

    if ctx.is_dry_run() {
        let actions: Vec<String> = ctx
            .exec
            .take_planned()
            .iter()
            .map(ToString::to_string)
            .collect();
        return Ok(match result {
            ApplyResult::Unchanged(reason) if actions.is_empty() => {
                StepOutcome::NoChange { reason }
            }
            ApplyResult::Changed(summary) if actions.is_empty() => StepOutcome::DryRun {
                actions: vec![summary],
            },
            _ => StepOutcome::DryRun { actions },
        });
    }

    if !step.postcondition(ctx)? {
        return Err(anyhow::Error::new(PostconditionFailed { step: name }));
    }

    Ok(match result {
        ApplyResult::Changed(summary) => StepOutcome::Changed { summary },
        ApplyResult::Unchanged(reason) => StepOutcome::NoChange { reason },
    })
}

fn report_failure(name: &str, source: &anyhow::Error, restore_point: Option<&Path>) {
    log::error!("Step {name} failed: {source:#}");
    if let Some(path) = restore_point {
        log::error!("Restore point: {}", path.display());
    }
}

fn interrupted(summary: &RunSummary, ctx: &StepContext) -> RunError {
    let completed = summary.completed();
    log::warn!("Interrupted; stopping before the next step");
    RunError::Interrupted {
        after: completed.last().copied(),
        restore_point: ctx.restore_point().map(Path::to_path_buf),
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AutoConfirm, NoObserver};
    use std::sync::atomic::AtomicBool;
    use syscmd::backend::scripted::ScriptedBackend;
    use syscmd::{CommandOutput, Executor};

    struct CmdStep {
        name: &'static str,
        readiness: Readiness,
        skippable: bool,
        holds: bool,
    }

    impl CmdStep {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                readiness: Readiness::Ready,
                skippable: true,
                holds: true,
            }
        }

        fn boxed(self) -> Box<dyn Step> {
            Box::new(self)
        }
    }

    impl Step for CmdStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> String {
            format!("Run {}", self.name)
        }

        fn skippable(&self) -> bool {
            self.skippable
        }

        fn precondition(&self, _ctx: &StepContext) -> anyhow::Result<Readiness> {
            Ok(self.readiness.clone())
        }

        fn apply(&self, ctx: &mut StepContext) -> anyhow::Result<ApplyResult> {
            ctx.exec.run_or_fail(self.name, &["--apply"])?;
            Ok(ApplyResult::Changed(format!("applied {}", self.name)))
        }

        fn postcondition(&self, _ctx: &StepContext) -> anyhow::Result<bool> {
            Ok(self.holds)
        }
    }

    struct BackupStep;

    impl Step for BackupStep {
        fn name(&self) -> &'static str {
            "backup"
        }

        fn description(&self) -> String {
            "Create restore point".into()
        }

        fn apply(&self, ctx: &mut StepContext) -> anyhow::Result<ApplyResult> {
            ctx.set_restore_point(PathBuf::from("/var/backups/gpuhost/20260101-000000"));
            Ok(ApplyResult::Changed("restore point created".into()))
        }
    }

    struct CancelAfterFirst<'a>(CancelFlag<'a>);

    impl RunObserver for CancelAfterFirst<'_> {
        fn on_step_start(&mut self, _index: usize, _total: usize, _name: &str, _desc: &str) {}
        fn on_step_complete(&mut self, _report: &StepReport) {
            self.0.cancel();
        }
    }

    fn six_steps() -> Vec<Box<dyn Step>> {
        vec![
            Box::new(BackupStep),
            CmdStep::new("two").boxed(),
            CmdStep::new("three").boxed(),
            CmdStep::new("four").boxed(),
            CmdStep::new("five").boxed(),
            CmdStep::new("six").boxed(),
        ]
    }

    fn run(
        runner: &Runner,
        config: &RunConfig,
        backend: &ScriptedBackend,
    ) -> Result<RunSummary, RunError> {
        let exec = Executor::new(Box::new(backend.clone())).dry_run(config.dry_run);
        let mut confirm = AutoConfirm;
        let mut ctx = StepContext::new(config, &exec, &mut confirm);
        let flag = AtomicBool::new(false);
        runner.execute(&mut ctx, &mut NoObserver, CancelFlag::new(&flag))
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = Runner::new(vec![
            CmdStep::new("docker").boxed(),
            CmdStep::new("docker").boxed(),
        ]);
        assert!(matches!(result, Err(RunError::DuplicateStep("docker"))));
    }

    #[test]
    fn test_unknown_skip_rejected_before_any_step() {
        let runner = Runner::new(six_steps()).unwrap();
        let backend = ScriptedBackend::new();
        let config = RunConfig::new().skip("nvidai");
        let err = run(&runner, &config, &backend).unwrap_err();
        assert!(matches!(err, RunError::InvalidSkip { ref name, .. } if name == "nvidai"));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_mandatory_step_cannot_be_skipped() {
        let mut required = CmdStep::new("requirements");
        required.skippable = false;
        let runner = Runner::new(vec![required.boxed()]).unwrap();
        let config = RunConfig::new().skip("requirements");
        let err = run(&runner, &config, &ScriptedBackend::new()).unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn test_skipped_step_makes_no_calls() {
        let runner = Runner::new(six_steps()).unwrap();
        let backend = ScriptedBackend::new();
        let config = RunConfig::new().skip("three");
        let summary = run(&runner, &config, &backend).unwrap();

        assert_eq!(summary.get("three").unwrap().outcome, StepOutcome::Skipped);
        assert!(!backend.commands().iter().any(|c| c.starts_with("three")));
        assert_eq!(backend.commands().len(), 4);
    }

    #[test]
    fn test_dry_run_reports_actions_without_mutating() {
        let runner = Runner::new(six_steps()).unwrap();
        let backend = ScriptedBackend::new();
        let config = RunConfig::new().dry_run(true);
        let summary = run(&runner, &config, &backend).unwrap();

        assert!(backend.mutations().is_empty());
        assert_eq!(
            summary.get("four").unwrap().outcome,
            StepOutcome::DryRun {
                actions: vec!["would run: four --apply".into()]
            }
        );
        assert_eq!(summary.completed().len(), 6);
    }

    #[test]
    fn test_failure_stops_the_run_and_reports_restore_point() {
        let runner = Runner::new(six_steps()).unwrap();
        let backend = ScriptedBackend::new();
        backend.on("three", CommandOutput::failed(1, "boom"));
        let err = run(&runner, &RunConfig::new(), &backend).unwrap_err();

        match &err {
            RunError::StepFailed {
                step,
                source,
                restore_point,
                completed,
            } => {
                assert_eq!(*step, "three");
                assert!(format!("{source:#}").contains("boom"));
                assert_eq!(
                    restore_point.as_deref(),
                    Some(Path::new("/var/backups/gpuhost/20260101-000000"))
                );
                assert_eq!(completed, &vec!["backup", "two"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        for later in ["four", "five", "six"] {
            assert!(!backend.commands().iter().any(|c| c.starts_with(later)));
        }
    }

    #[test]
    fn test_continue_on_error_runs_everything_but_fails() {
        let runner = Runner::new(six_steps()).unwrap();
        let backend = ScriptedBackend::new();
        backend.on("three", CommandOutput::failed(1, "boom"));
        let config = RunConfig::new().continue_on_error(true);
        let err = run(&runner, &config, &backend).unwrap_err();

        assert!(matches!(err, RunError::Incomplete { ref failed, .. } if failed == &vec!["three"]));
        assert!(backend.commands().iter().any(|c| c.starts_with("six")));
    }

    #[test]
    fn test_precondition_outcomes() {
        let mut satisfied = CmdStep::new("docker");
        satisfied.readiness = Readiness::AlreadySatisfied("docker 24.0 installed".into());
        let mut absent = CmdStep::new("nvidia");
        absent.readiness = Readiness::NotApplicable("no GPU detected".into());
        let runner = Runner::new(vec![satisfied.boxed(), absent.boxed()]).unwrap();
        let backend = ScriptedBackend::new();
        let summary = run(&runner, &RunConfig::new(), &backend).unwrap();

        assert!(backend.calls().is_empty());
        assert!(matches!(
            summary.get("docker").unwrap().outcome,
            StepOutcome::NoChange { .. }
        ));
        assert_eq!(
            summary.get("nvidia").unwrap().outcome,
            StepOutcome::NothingToDo {
                reason: "no GPU detected".into()
            }
        );
    }

    #[test]
    fn test_postcondition_failure_is_step_failure() {
        let mut step = CmdStep::new("ssh-hardening");
        step.holds = false;
        let runner = Runner::new(vec![step.boxed()]).unwrap();
        let err = run(&runner, &RunConfig::new(), &ScriptedBackend::new()).unwrap_err();
        match err {
            RunError::StepFailed { source, .. } => {
                assert!(source.downcast_ref::<PostconditionFailed>().is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_interrupt_stops_at_step_boundary() {
        let runner = Runner::new(six_steps()).unwrap();
        let backend = ScriptedBackend::new();
        let exec = Executor::new(Box::new(backend.clone()));
        let config = RunConfig::new();
        let mut confirm = AutoConfirm;
        let mut ctx = StepContext::new(&config, &exec, &mut confirm);
        let flag = AtomicBool::new(false);
        let cancel = CancelFlag::new(&flag);

        let err = runner
            .execute(&mut ctx, &mut CancelAfterFirst(cancel), cancel)
            .unwrap_err();
        assert!(matches!(err, RunError::Interrupted { after: Some("backup"), .. }));
        assert!(err.restore_point().is_some());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_finalizer_runs_only_after_success() {
        let backend = ScriptedBackend::new();
        let runner = Runner::new(vec![CmdStep::new("docker").boxed()])
            .unwrap()
            .with_finalizer(CmdStep::new("services").boxed());
        let summary = run(&runner, &RunConfig::new(), &backend).unwrap();
        assert!(summary.finalizer.is_some());
        assert!(backend.commands().contains(&"services --apply".to_string()));

        let backend = ScriptedBackend::new();
        backend.on("docker", CommandOutput::failed(100, "E: broken"));
        let runner = Runner::new(vec![CmdStep::new("docker").boxed()])
            .unwrap()
            .with_finalizer(CmdStep::new("services").boxed());
        assert!(run(&runner, &RunConfig::new(), &backend).is_err());
        assert!(!backend.commands().iter().any(|c| c.starts_with("services")));
    }
}

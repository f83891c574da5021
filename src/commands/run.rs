//! Shared driver for the `setup` and `convert` sequences

use anyhow::{Context as _, Result};
use chrono::Utc;
use colored::Colorize;
use std::path::PathBuf;
use std::rc::Rc;
use stepkit::{
    CancelFlag, ConfirmCallback, RunConfig, RunError, RunObserver, RunSummary, StepContext,
    StepOutcome, StepReport,
};
use syscmd::Executor;

use crate::Context as AppContext;
use crate::cli::RunArgs;
use crate::config::{self, HostConfig};
use crate::paths;
use crate::probe;
use crate::signal;
use crate::state::{RunRecord, RunState, RunStatus};
use crate::steps::{self, Sequence, Settings, StepName};
use crate::ui;

/// Flags that map onto config keys rather than the skip set directly
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    pub skip_nvidia: bool,
    pub skip_docker: bool,
}

/// Everything a run needs, resolved from defaults, file, `--set` and flags
#[derive(Debug)]
pub struct Resolved {
    pub settings: Rc<Settings>,
    pub run: RunConfig,
}

/// Layer `--set` pairs and explicit flags over a loaded config.
///
/// Precedence, later wins: defaults, config file, `--set`, flags.
pub fn resolve(
    ctx: &AppContext,
    kind: Sequence,
    mut host: HostConfig,
    args: &RunArgs,
    flags: FeatureFlags,
    sudo_user: Option<&str>,
) -> Result<Resolved> {
    let applied = host.apply_overrides(&args.set)?;
    if flags.skip_nvidia {
        host.install_nvidia = false;
    }
    if flags.skip_docker {
        host.install_docker = false;
    }

    let mut run = RunConfig::new()
        .dry_run(args.dry_run)
        .verbose(ctx.verbose > 0)
        .continue_on_error(args.continue_on_error);
    for name in &args.skip {
        run = run.skip(name.as_str());
    }
    if kind == Sequence::Setup {
        if !host.install_nvidia {
            run = run.skip(StepName::Nvidia.as_str());
        }
        if !host.install_docker {
            run = run.skip(StepName::Docker.as_str());
        }
    }
    for (key, value) in applied {
        run = run.with_override(key.to_string(), value);
    }

    let target_user = host.resolve_target_user(sudo_user);
    Ok(Resolved {
        settings: Rc::new(Settings {
            host,
            target_user,
            backup_root: paths::backup_dir(),
            assume_yes: args.yes,
        }),
        run,
    })
}

// ============================================================================
// Terminal callbacks
// ============================================================================

/// Prompts through dialoguer; declines when nobody is watching.
pub struct TerminalConfirm {
    pub assume_yes: bool,
}

impl ConfirmCallback for TerminalConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        if self.assume_yes {
            log::info!("Confirmed by --yes: {prompt}");
            return Ok(true);
        }
        if !ui::is_interactive() {
            log::warn!("Not a terminal, declining: {prompt}");
            return Ok(false);
        }
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")
    }
}

/// Renders step progress to the terminal
pub struct TerminalObserver {
    quiet: bool,
}

impl TerminalObserver {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl RunObserver for TerminalObserver {
    fn on_step_start(&mut self, index: usize, total: usize, _name: &str, description: &str) {
        if !self.quiet {
            ui::step(index, total, description);
        }
    }

    fn on_step_complete(&mut self, report: &StepReport) {
        if self.quiet {
            return;
        }
        match &report.outcome {
            StepOutcome::Changed { summary } => ui::success(summary),
            StepOutcome::NoChange { reason } => ui::dim(&format!("no change: {reason}")),
            StepOutcome::NothingToDo { reason } => ui::dim(&format!("nothing to do: {reason}")),
            StepOutcome::Skipped => ui::dim("skipped"),
            StepOutcome::DryRun { actions } => {
                for action in actions {
                    println!("  {} {action}", "→".cyan());
                }
            }
            StepOutcome::Failed { error } => ui::error(&format!("{}: {error}", report.name)),
        }
    }

    fn on_step_failed(&mut self, name: &str, error: &anyhow::Error) {
        ui::error(&format!("Step '{name}' failed: {error:#}"));
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Print a sequence's steps in order.
pub fn list_steps(kind: Sequence) -> Result<()> {
    let settings = Rc::new(Settings {
        host: HostConfig::default(),
        target_user: None,
        backup_root: paths::backup_dir(),
        assume_yes: false,
    });
    let runner = steps::sequence(kind, &settings)?;

    ui::header(&format!("gpuhost {} steps", kind.as_str()));
    for step in runner.steps() {
        let marker = if step.skippable() { " " } else { "*" };
        println!("  {marker} {:<22} {}", step.name().bold(), step.description().dimmed());
    }
    println!();
    ui::dim("* required, cannot be skipped");
    Ok(())
}

/// Run one sequence end to end.
pub fn run(ctx: &AppContext, kind: Sequence, args: &RunArgs, flags: FeatureFlags) -> Result<()> {
    if args.list_steps {
        return list_steps(kind);
    }

    let host = config::load(args.config.as_deref())?;
    let resolved = resolve(ctx, kind, host, args, flags, probe::sudo_user().as_deref())?;
    let Resolved { settings, run } = resolved;

    for (key, value) in settings.host.effective_values() {
        log::debug!("config {key} = {value}");
    }
    if !run.skip.is_empty() {
        log::info!("Skipping: {}", run.skip.iter().cloned().collect::<Vec<_>>().join(", "));
    }

    let runner = steps::sequence(kind, &settings)?;
    let exec = Executor::system()
        .dry_run(run.dry_run)
        .with_timeout(settings.host.command_timeout());
    // setup checks privileges in its first step; convert has no such step.
    if kind == Sequence::Convert && !run.dry_run && !probe::is_root(&exec)? {
        return Err(steps::PreconditionError::NotRoot.into());
    }
    let mut confirm = TerminalConfirm {
        assume_yes: settings.assume_yes,
    };
    let mut observer = TerminalObserver::new(ctx.quiet);

    if !ctx.quiet {
        let title = match kind {
            Sequence::Setup => "gpuhost setup: GPU container host",
            Sequence::Convert => "gpuhost convert: headless server",
        };
        ui::header(title);
        if run.dry_run {
            ui::warn("Dry run: nothing will be changed");
        }
    }

    let started = Utc::now();
    let result = {
        let mut step_ctx = StepContext::new(&run, &exec, &mut confirm);
        runner.execute(&mut step_ctx, &mut observer, CancelFlag::new(signal::flag()))
    };

    if !run.dry_run {
        save_state(kind, started, &result);
    }

    let summary = result?;
    print_summary(ctx, &summary, run.dry_run);
    Ok(())
}

fn print_summary(ctx: &AppContext, summary: &RunSummary, dry_run: bool) {
    if ctx.quiet {
        return;
    }
    ui::section("Summary");
    ui::kv("changed", &summary.changed().to_string());
    ui::kv("unchanged", &summary.unchanged().to_string());
    ui::kv("nothing to do", &summary.nothing_to_do().to_string());
    ui::kv("skipped", &summary.skipped().to_string());
    if let Some(point) = &summary.restore_point {
        ui::kv("restore point", &point.display().to_string());
    }
    println!();
    if dry_run {
        ui::info("Dry run complete. Re-run without --dry-run to apply.");
    } else {
        ui::success("Done.");
    }
}

/// Record a live run for `--restore`; failures here only warn.
fn save_state(kind: Sequence, started: chrono::DateTime<Utc>, result: &Result<RunSummary, RunError>) {
    let record = run_record(kind, started, result);
    let mut state = match RunState::load() {
        Ok(state) => state,
        Err(e) => {
            log::warn!("Ignoring unreadable run state: {e:#}");
            RunState::default()
        }
    };
    state.record(record);
    if let Err(e) = state.save() {
        log::warn!("Could not save run state: {e:#}");
    }
}

fn run_record(
    kind: Sequence,
    started: chrono::DateTime<Utc>,
    result: &Result<RunSummary, RunError>,
) -> RunRecord {
    let names = |steps: &[&'static str]| steps.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
    let (status, completed, failed_step, restore_point): (_, _, _, Option<PathBuf>) = match result {
        Ok(summary) => (
            RunStatus::Succeeded,
            names(&summary.completed()),
            None,
            summary.restore_point.clone(),
        ),
        Err(e) => {
            let status = match e {
                RunError::Interrupted { .. } => RunStatus::Interrupted,
                _ => RunStatus::Failed,
            };
            let failed_step = match e {
                RunError::StepFailed { step, .. } => Some((*step).to_string()),
                RunError::Incomplete { failed, .. } => Some(failed.join(",")),
                _ => None,
            };
            (status, names(e.completed()), failed_step, e.restore_point().map(PathBuf::from))
        }
    };
    RunRecord {
        sequence: kind.as_str().to_string(),
        started,
        finished: Utc::now(),
        status,
        completed,
        failed_step,
        restore_point,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppContext {
        AppContext {
            verbose: 0,
            quiet: true,
        }
    }

    #[test]
    fn test_skip_nvidia_flag_beats_config() {
        let host = HostConfig {
            install_nvidia: true,
            ..HostConfig::default()
        };
        let flags = FeatureFlags {
            skip_nvidia: true,
            skip_docker: false,
        };
        let resolved = resolve(&app(), Sequence::Setup, host, &RunArgs::default(), flags, None).unwrap();
        assert!(!resolved.settings.host.install_nvidia);
        assert!(resolved.run.is_skipped("nvidia"));
        assert!(!resolved.run.is_skipped("docker"));
    }

    #[test]
    fn test_set_overrides_file_and_flags_override_set() {
        let args = RunArgs {
            set: vec!["install_nvidia=true".into(), "ssh_port=2222".into()],
            ..RunArgs::default()
        };
        let flags = FeatureFlags {
            skip_nvidia: true,
            skip_docker: false,
        };
        let resolved = resolve(&app(), Sequence::Setup, HostConfig::default(), &args, flags, None).unwrap();
        assert_eq!(resolved.settings.host.ssh_port, 2222);
        assert!(!resolved.settings.host.install_nvidia);
        assert_eq!(resolved.run.overrides.get("ssh_port").map(String::as_str), Some("2222"));
    }

    #[test]
    fn test_install_docker_false_skips_docker() {
        let host = HostConfig {
            install_docker: false,
            ..HostConfig::default()
        };
        let resolved =
            resolve(&app(), Sequence::Setup, host, &RunArgs::default(), FeatureFlags::default(), None).unwrap();
        assert!(resolved.run.is_skipped("docker"));
    }

    #[test]
    fn test_convert_ignores_feature_keys() {
        let host = HostConfig {
            install_docker: false,
            install_nvidia: false,
            ..HostConfig::default()
        };
        let resolved =
            resolve(&app(), Sequence::Convert, host, &RunArgs::default(), FeatureFlags::default(), None).unwrap();
        assert!(resolved.run.skip.is_empty());
    }

    #[test]
    fn test_explicit_skips_and_target_user() {
        let args = RunArgs {
            skip: vec![StepName::KernelTuning],
            dry_run: true,
            yes: true,
            ..RunArgs::default()
        };
        let resolved = resolve(
            &app(),
            Sequence::Setup,
            HostConfig::default(),
            &args,
            FeatureFlags::default(),
            Some("alice"),
        )
        .unwrap();
        assert!(resolved.run.is_skipped("kernel-tuning"));
        assert!(resolved.run.dry_run);
        assert!(resolved.settings.assume_yes);
        assert_eq!(resolved.settings.target_user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_bad_set_is_rejected() {
        let args = RunArgs {
            set: vec!["warp_factor=9".into()],
            ..RunArgs::default()
        };
        assert!(resolve(&app(), Sequence::Setup, HostConfig::default(), &args, FeatureFlags::default(), None).is_err());
    }

    #[test]
    fn test_run_record_for_failed_step() {
        let result: Result<RunSummary, RunError> = Err(RunError::StepFailed {
            step: "docker",
            source: anyhow::anyhow!("apt-get failed"),
            restore_point: Some(PathBuf::from("/var/backups/gpuhost/20260101-000000")),
            completed: vec!["system-requirements", "backup"],
        });
        let record = run_record(Sequence::Setup, Utc::now(), &result);
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failed_step.as_deref(), Some("docker"));
        assert_eq!(record.completed, vec!["system-requirements", "backup"]);
        assert!(record.restore_point.is_some());
    }

    #[test]
    fn test_assume_yes_confirms() {
        let mut yes = TerminalConfirm { assume_yes: true };
        assert!(yes.confirm("remove the desktop?").unwrap());
    }
}

//! Roll configuration files back to a restore point

use anyhow::{Context as _, Result};
use colored::Colorize;
use restorepoint::{BackupManager, BackupRecord, RestoreReport};
use std::path::Path;
use syscmd::Executor;

use crate::Context as AppContext;
use crate::paths;
use crate::state::RunState;
use crate::ui;

/// Pick the restore point: `--from`, then the last recorded run, then the newest on disk.
pub fn locate(from: Option<&Path>, state: &RunState, manager: &BackupManager<'_>) -> Result<BackupRecord> {
    if let Some(dir) = from {
        return manager.load(dir).with_context(|| format!("Cannot use {}", dir.display()));
    }
    if let Some(dir) = &state.last_restore_point {
        match manager.load(dir) {
            Ok(record) => return Ok(record),
            Err(e) => log::warn!("Recorded restore point unusable, falling back to the newest: {e}"),
        }
    }
    Ok(manager.latest()?)
}

pub fn run(ctx: &AppContext, from: Option<&Path>, dry_run: bool, yes: bool) -> Result<()> {
    let state = RunState::load().unwrap_or_else(|e| {
        log::warn!("Ignoring unreadable run state: {e:#}");
        RunState::default()
    });
    let exec = Executor::system().dry_run(dry_run);
    let manager = BackupManager::new(&exec, paths::backup_dir());
    let record = locate(from, &state, &manager)?;

    ui::header("gpuhost restore");
    ui::kv("restore point", &record.destination.display().to_string());
    ui::kv("created", &record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string());
    ui::kv("files", &record.file_count().to_string());
    if let Some(snapshot) = &record.package_snapshot {
        ui::kv("package selections", &snapshot.display().to_string());
    }
    println!();

    if !dry_run && !yes {
        if !ui::is_interactive() {
            anyhow::bail!("Refusing to restore without confirmation (pass --yes)");
        }
        let confirmed = dialoguer::Confirm::new()
            .with_prompt("Overwrite the current files with this restore point?")
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Restore cancelled");
            return Ok(());
        }
    }

    let report = manager.restore(&record);
    print_report(ctx, &report, dry_run);

    if !report.is_success() {
        anyhow::bail!("{} file(s) could not be restored", report.failed.len());
    }
    if record.package_snapshot.is_some() && !dry_run {
        ui::dim("Package selections were saved but not reapplied; use dpkg --set-selections to roll packages back.");
    }
    Ok(())
}

fn print_report(ctx: &AppContext, report: &RestoreReport, dry_run: bool) {
    if ctx.verbose > 0 {
        for path in &report.restored {
            ui::dim(&path.display().to_string());
        }
    }
    for (path, error) in &report.failed {
        ui::error(&format!("{}: {error}", path.display()));
    }
    let verb = if dry_run { "would restore" } else { "restored" };
    println!(
        "  {} {verb}, {} skipped, {} failed",
        report.restored.len().to_string().green(),
        report.skipped.len().to_string().yellow(),
        report.failed.len().to_string().red()
    );
}

//! `gpuhost verify`: read-only health check of a provisioned host

use anyhow::Result;
use colored::Colorize;
use syscmd::Executor;

use crate::Context as AppContext;
use crate::config;
use crate::ui;
use crate::verify::{self, CheckResult, CheckStatus, Health, HostFacts, Report};

pub fn run(ctx: &AppContext) -> Result<()> {
    let host = config::load(None)?;
    let exec = Executor::system().with_timeout(host.command_timeout());

    let facts = HostFacts::detect(&exec, &host);
    let groups = verify::host_checks(&host, &facts);

    let pb = ui::spinner("Checking host...");
    let report = verify::run(&exec, &groups, |check| {
        pb.set_message(format!("{}: {}", check.group, check.description));
    });
    pb.finish_and_clear();

    if !ctx.quiet {
        ui::header("gpuhost verify");
        print_results(&report.results, ctx.verbose > 0);
    }
    print_totals(&report);

    if !report.is_success() {
        anyhow::bail!("{} check(s) failed", report.failed);
    }
    Ok(())
}

fn print_results(results: &[CheckResult], verbose: bool) {
    let mut current = "";
    for result in results {
        if result.group != current {
            current = result.group.as_str();
            ui::section(current);
        }
        let icon = match result.status {
            CheckStatus::Pass => "✓".green(),
            CheckStatus::Fail => "✗".red(),
            CheckStatus::Warn => "⚠".yellow(),
        };
        println!("  {icon} {}", result.description);
        if result.status != CheckStatus::Pass || verbose {
            ui::dim(&format!("  expected {}, got {}", result.expected, result.actual));
        }
    }
}

fn print_totals(report: &Report) {
    let health = match report.health {
        Health::Ok => report.health.to_string().green().bold(),
        Health::Degraded => report.health.to_string().yellow().bold(),
        Health::Failed => report.health.to_string().red().bold(),
    };
    println!();
    println!(
        "  {} passed, {} failed, {} warnings of {} checks ({:.1}%): {health}",
        report.passed.to_string().green(),
        report.failed.to_string().red(),
        report.warnings.to_string().yellow(),
        report.total,
        report.success_rate
    );
}

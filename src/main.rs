mod cli;
mod commands;
mod config;
mod logging;
mod paths;
mod probe;
mod signal;
mod state;
mod steps;
mod templates;
mod ui;
mod verify;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::process::ExitCode;
use stepkit::RunError;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    if let Command::Completions { shell } = cli.command {
        generate(shell, &mut Cli::command(), "gpuhost", &mut io::stdout());
        return ExitCode::SUCCESS;
    }

    let log_file = logging::init(cli.verbose, cli.quiet, &paths::log_file());
    signal::install();
    log::info!("gpuhost {} started", env!("CARGO_PKG_VERSION"));

    match dispatch(&ctx, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e, log_file.as_deref());
            ExitCode::FAILURE
        }
    }
}

fn dispatch(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Setup(args) => commands::setup::run(ctx, args),
        Command::Convert(args) => commands::convert::run(ctx, args),
        Command::Verify => commands::verify::run(ctx),
        Command::Completions { .. } => Ok(()),
    }
}

/// Print the error chain, the failing step and where to roll back from.
fn report_error(error: &anyhow::Error, log_file: Option<&std::path::Path>) {
    log::error!("{error:#}");
    ui::error(&error.to_string());
    for cause in error.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }

    if let Some(run) = error.downcast_ref::<RunError>() {
        if let RunError::StepFailed { step, .. } = run {
            eprintln!("  failed step: {step}");
        }
        let completed = run.completed();
        if !completed.is_empty() {
            eprintln!("  completed: {}", completed.join(", "));
        }
        match run.restore_point() {
            Some(point) => {
                eprintln!("  restore point: {}", point.display());
                eprintln!("  roll back with: gpuhost setup --restore --from {}", point.display());
            }
            None => eprintln!("  restore point: none created"),
        }
    }
    if let Some(path) = log_file {
        eprintln!("  log: {}", path.display());
    }
}

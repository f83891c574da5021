use crate::steps::StepName;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gpuhost")]
#[command(version)]
#[command(about = "Provision Ubuntu 22.04 machines as GPU container hosts", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision this machine as a GPU container host
    Setup(SetupArgs),

    /// Convert a desktop install into a headless server
    Convert(ConvertArgs),

    /// Check the live host against the expected configuration
    Verify,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Options shared by both provisioning sequences
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Show what would be done without changing anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Skip a step (repeatable)
    #[arg(long = "skip", value_name = "STEP", value_enum)]
    pub skip: Vec<StepName>,

    /// Config file (default: /etc/gpuhost/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override a config value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Record failed steps and keep going
    #[arg(long)]
    pub continue_on_error: bool,

    /// Do not prompt; refuse anything that needs confirmation to override
    #[arg(short, long)]
    pub yes: bool,

    /// List the steps of this sequence and exit
    #[arg(long)]
    pub list_steps: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SetupArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Do not install the NVIDIA driver and container toolkit
    #[arg(long)]
    pub skip_nvidia: bool,

    /// Do not install Docker
    #[arg(long)]
    pub skip_docker: bool,

    /// Restore the files saved by a previous run and exit
    #[arg(long)]
    pub restore: bool,

    /// Restore point directory to restore from (default: the latest)
    #[arg(long, value_name = "DIR", requires = "restore")]
    pub from: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConvertArgs {
    #[command(flatten)]
    pub run: RunArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_setup_flags() {
        let cli = Cli::try_parse_from([
            "gpuhost", "-v", "setup", "-n", "--skip-nvidia", "--skip", "firewall", "--skip",
            "kernel-tuning", "--set", "ssh_port=2222",
        ]);
        // firewall is a convert step, but parsing accepts any known step name
        let cli = cli.unwrap();
        assert_eq!(cli.verbose, 1);
        let Command::Setup(args) = cli.command else {
            panic!("expected setup");
        };
        assert!(args.run.dry_run);
        assert!(args.skip_nvidia);
        assert_eq!(args.run.skip, vec![StepName::Firewall, StepName::KernelTuning]);
        assert_eq!(args.run.set, vec!["ssh_port=2222".to_string()]);
    }

    #[test]
    fn test_unknown_step_rejected() {
        assert!(Cli::try_parse_from(["gpuhost", "setup", "--skip", "kernel"]).is_err());
    }

    #[test]
    fn test_from_requires_restore() {
        assert!(Cli::try_parse_from(["gpuhost", "setup", "--from", "/tmp/x"]).is_err());
        assert!(Cli::try_parse_from(["gpuhost", "setup", "--restore", "--from", "/tmp/x"]).is_ok());
    }

    #[test]
    fn test_convert_has_no_nvidia_flag() {
        assert!(Cli::try_parse_from(["gpuhost", "convert", "--skip-nvidia"]).is_err());
        assert!(Cli::try_parse_from(["gpuhost", "convert", "-n", "-y"]).is_ok());
    }
}

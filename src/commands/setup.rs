//! `gpuhost setup`: provision a GPU container host

use anyhow::Result;

use super::restore;
use super::run::{self, FeatureFlags};
use crate::Context as AppContext;
use crate::cli::SetupArgs;
use crate::steps::Sequence;

pub fn run(ctx: &AppContext, args: SetupArgs) -> Result<()> {
    if args.restore {
        return restore::run(ctx, args.from.as_deref(), args.run.dry_run, args.run.yes);
    }
    let flags = FeatureFlags {
        skip_nvidia: args.skip_nvidia,
        skip_docker: args.skip_docker,
    };
    run::run(ctx, Sequence::Setup, &args.run, flags)
}

//! `gpuhost convert`: turn a desktop install into a headless server

use anyhow::Result;

use super::run::{self, FeatureFlags};
use crate::Context as AppContext;
use crate::cli::ConvertArgs;
use crate::steps::Sequence;

pub fn run(ctx: &AppContext, args: ConvertArgs) -> Result<()> {
    run::run(ctx, Sequence::Convert, &args.run, FeatureFlags::default())
}

//! `avlt cleanup-locks` — Remove orphaned lock sentinels.

use clap::Args;

use super::Context;
use crate::output::{DIM, GREEN, RESET};

/// Arguments for the `cleanup-locks` command.
#[derive(Args, Debug)]
pub struct CleanupLocksArgs {
    /// Container keys. If empty, checks every container with an image.
    pub keys: Vec<String>,
}

/// Executes the `cleanup-locks` command.
///
/// # Errors
///
/// Returns an error if a key is invalid or the storage root cannot be read.
pub fn execute(args: CleanupLocksArgs, ctx: &Context) -> anyhow::Result<()> {
    let containers = ctx.containers(&args.keys)?;
    let removed = ctx.locks.cleanup_stale(&containers);
    if removed == 0 {
        eprintln!("  {DIM}No stale locks.{RESET}");
    } else {
        eprintln!("  {GREEN}Removed{RESET} {removed} stale lock(s)");
    }
    Ok(())
}

//! `avlt detach-images` — Detach every attached disk image.

use clap::Args;

use super::Context;
use crate::output::{GREEN, RESET};

/// Arguments for the `detach-images` command.
#[derive(Args, Debug)]
pub struct DetachImagesArgs {}

/// Executes the `detach-images` command.
///
/// # Errors
///
/// Returns an error if the disk list cannot be read.
pub async fn execute(_args: DetachImagesArgs, ctx: &Context) -> anyhow::Result<()> {
    let detached = ctx.volumes.detach_all_disk_images().await?;
    eprintln!("  {GREEN}Detached{RESET} {detached} disk image(s)");
    Ok(())
}

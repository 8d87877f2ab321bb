//! `avlt resize` — Resize an unmounted disk image.

use clap::Args;

use super::Context;
use crate::output::{BOLD, GREEN, RESET};

/// Arguments for the `resize` command.
#[derive(Args, Debug)]
pub struct ResizeArgs {
    /// Container key.
    pub key: String,

    /// New maximum size, e.g. `100G`.
    pub size: String,
}

/// Executes the `resize` command.
///
/// # Errors
///
/// Returns an error if the image is missing, mounted, or cannot be resized.
pub async fn execute(args: ResizeArgs, ctx: &Context) -> anyhow::Result<()> {
    let container = ctx.container(&args.key)?;
    if ctx.volumes.is_mounted(&container).await {
        anyhow::bail!("{} is mounted; unmount it before resizing", container.key);
    }
    ctx.volumes.resize_image(&container, &args.size).await?;
    eprintln!(
        "  {GREEN}Resized{RESET} {BOLD}{}{RESET} to {}",
        container.key, args.size
    );
    Ok(())
}

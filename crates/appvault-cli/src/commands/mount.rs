//! `avlt mount` — Mount a container's disk image.

use std::time::Duration;

use appvault_common::types::{Container, InternalDataStrategy};
use appvault_runtime::{internal_data, launch};
use clap::Args;

use super::Context;
use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW};
use crate::prompt;

/// Arguments for the `mount` command.
#[derive(Args, Debug)]
pub struct MountArgs {
    /// Container key.
    pub key: String,

    /// Show the volume in Finder (overrides the configured `nobrowse`).
    #[arg(long, conflicts_with = "nobrowse")]
    pub browse: bool,

    /// Hide the volume from Finder.
    #[arg(long)]
    pub nobrowse: bool,

    /// Hold the container's lock and unmount it once its application exits.
    #[arg(long)]
    pub hold: bool,

    /// What to do with files found in the unmounted mount point
    /// (discard, merge-then-delete, leave). Asks when neither this nor the
    /// configuration decides.
    #[arg(long, value_name = "STRATEGY")]
    pub internal_data: Option<InternalDataStrategy>,
}

impl MountArgs {
    const fn resolve_nobrowse(&self, configured: bool) -> bool {
        if self.browse {
            false
        } else if self.nobrowse {
            true
        } else {
            configured
        }
    }
}

/// Strategy for files hidden by mounting: the flag, then the configuration,
/// then the user, asked only when such files exist.
async fn resolve_internal_data(
    args: &MountArgs,
    ctx: &Context,
    container: &Container,
) -> anyhow::Result<Option<InternalDataStrategy>> {
    if let Some(strategy) = args.internal_data.or(ctx.config.internal_data) {
        return Ok(Some(strategy));
    }
    if !container.image_path.exists() || ctx.volumes.is_mounted(container).await {
        return Ok(None);
    }
    let items = internal_data::detect_internal_data(container)?;
    if items.is_empty() {
        return Ok(None);
    }
    let choice = prompt::choose_internal_data(
        &container.key,
        &container.mount_point,
        items.len(),
        ctx.assume_yes,
    )
    .await?;
    Ok(Some(choice))
}

/// Executes the `mount` command.
///
/// # Errors
///
/// Returns an error if the image is missing or cannot be attached, or if
/// files in the mount point would be hidden and no strategy was chosen.
pub async fn execute(args: MountArgs, ctx: &Context) -> anyhow::Result<()> {
    let container = ctx.container(&args.key)?;
    let nobrowse = args.resolve_nobrowse(ctx.config.nobrowse);

    if !container.image_path.exists() {
        anyhow::bail!(
            "No disk image for {}. Create it first: avlt create {}",
            container.key,
            container.key
        );
    }
    let strategy = resolve_internal_data(&args, ctx, &container).await?;

    if !args.hold {
        launch::prepare_mount(&ctx.volumes, &container, nobrowse, strategy).await?;
        eprintln!(
            "  {GREEN}Mounted{RESET} {BOLD}{}{RESET} at {}",
            container.key,
            container.mount_point.display()
        );
        return Ok(());
    }

    let locked =
        launch::prepare_launch(&ctx.volumes, &ctx.locks, &container, nobrowse, strategy).await?;
    eprintln!(
        "  {GREEN}Mounted{RESET} {BOLD}{}{RESET} at {}",
        container.key,
        container.mount_point.display()
    );
    if !locked {
        eprintln!("  {YELLOW}Note:{RESET} another process holds this container's lock.");
    }
    eprintln!("  {DIM}Waiting for the application to exit. Press Ctrl+C to stop watching.{RESET}");

    let poll = ctx.config.watcher.poll_interval();
    launch::watch_exit_and_unmount(&ctx.escalator, container.clone(), poll);
    let tasks = ctx.escalator.tasks();
    tokio::select! {
        () = async {
            while tasks.active_keys().contains(&container.key) {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        } => {
            eprintln!("  {DIM}Application exited.{RESET}");
        }
        _ = tokio::signal::ctrl_c() => {
            let _ = tasks.cancel(&container.key).await;
            eprintln!("  {DIM}Stopped watching; {} stays mounted.{RESET}", container.key);
        }
    }
    ctx.locks.release_all();
    Ok(())
}

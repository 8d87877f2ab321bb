//! `avlt eject-drive` — Eject the external drive holding the disk images.

use appvault_runtime::confirm::ForceConfirmation;
use clap::Args;

use super::Context;
use crate::output::{BOLD, GREEN, RESET, YELLOW};
use crate::prompt::PromptConfirmation;

/// Arguments for the `eject-drive` command.
#[derive(Args, Debug)]
pub struct EjectDriveArgs {
    /// Force the eject without asking if the drive is busy.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `eject-drive` command.
///
/// # Errors
///
/// Returns an error if the storage root is on the internal disk or the
/// drive cannot be ejected.
pub async fn execute(args: EjectDriveArgs, ctx: &Context) -> anyhow::Result<()> {
    let storage_root = &ctx.config.storage_root;
    if !ctx.volumes.is_external_drive(storage_root).await {
        anyhow::bail!(
            "{} is on an internal disk; nothing to eject",
            storage_root.display()
        );
    }
    let Some(device) = ctx.volumes.device_path(storage_root).await else {
        anyhow::bail!("could not resolve the device for {}", storage_root.display());
    };
    let name = ctx
        .volumes
        .volume_info(storage_root)
        .await
        .map_or_else(|| device.clone(), |info| info.display_name());

    let mounted = ctx.volumes.count_mounted_volumes(storage_root).await;
    if mounted > 0 {
        eprintln!("  {YELLOW}Note:{RESET} {mounted} volume(s) still mounted from {name}.");
    }

    if let Err(e) = ctx.volumes.eject_drive(&device, false).await {
        tracing::warn!(device = %device, error = %e, "drive eject failed");
        let confirmation = PromptConfirmation::new(args.force || ctx.assume_yes);
        if !confirmation.confirm_force_eject(&name).await {
            return Err(e.into());
        }
        ctx.volumes.eject_drive(&device, true).await?;
    }
    eprintln!("  {GREEN}Ejected{RESET} {BOLD}{name}{RESET}");
    Ok(())
}

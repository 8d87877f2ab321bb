//! `avlt status` — Show the mount state of containers.

use appvault_common::types::MountState;
use clap::Args;
use serde::Serialize;

use super::Context;
use crate::output::{self, BOLD, DIM, RESET};

/// Arguments for the `status` command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Container keys. If empty, shows every container with an image.
    pub keys: Vec<String>,

    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct Row {
    key: String,
    #[serde(flatten)]
    state: MountState,
    locked_here: bool,
}

/// Executes the `status` command.
///
/// # Errors
///
/// Returns an error if a key is invalid or the storage root cannot be read.
pub async fn execute(args: StatusArgs, ctx: &Context) -> anyhow::Result<()> {
    let containers = ctx.containers(&args.keys)?;
    let mut rows = Vec::with_capacity(containers.len());
    for container in &containers {
        rows.push(Row {
            key: container.key.to_string(),
            state: ctx.volumes.mount_state(container).await,
            locked_here: ctx.locks.is_held(&container.key),
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        eprintln!(
            "  {DIM}No containers in {}{RESET}",
            ctx.config.storage_root.display()
        );
        return Ok(());
    }

    println!("{BOLD}{:<40} {:<10} {:<10} {}{RESET}", "CONTAINER", "IMAGE", "SIZE", "MOUNT");
    for row in &rows {
        let size = row
            .state
            .size_on_disk
            .map_or_else(|| String::from("-"), output::format_bytes);
        let mount = match &row.state.volume_path {
            Some(path) => output::flag(true, &path.display().to_string(), ""),
            None => output::flag(false, "", "not mounted"),
        };
        println!(
            "{:<40} {:<10} {:<10} {}",
            row.key,
            if row.state.exists { "present" } else { "missing" },
            size,
            mount
        );
    }
    Ok(())
}

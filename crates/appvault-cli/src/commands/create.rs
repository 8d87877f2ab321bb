//! `avlt create` — Create the disk image backing a container.

use clap::Args;

use super::Context;
use crate::output::{BOLD, DIM, GREEN, RESET};

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container key (the application's bundle identifier).
    pub key: String,

    /// Maximum image size, e.g. `50G`. Defaults to the configured size.
    #[arg(short, long)]
    pub size: Option<String>,
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if the key is invalid or the image cannot be created.
pub async fn execute(args: CreateArgs, ctx: &Context) -> anyhow::Result<()> {
    let container = ctx.container(&args.key)?;
    if container.image_path.exists() {
        eprintln!(
            "  {DIM}Image already exists:{RESET} {}",
            container.image_path.display()
        );
        return Ok(());
    }
    let path = ctx
        .volumes
        .ensure_image_exists(&container, args.size.as_deref())
        .await?;
    eprintln!(
        "  {GREEN}Created{RESET} {BOLD}{}{RESET} {DIM}{}{RESET}",
        container.key,
        path.display()
    );
    Ok(())
}

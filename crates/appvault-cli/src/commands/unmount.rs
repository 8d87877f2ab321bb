//! `avlt unmount` — Unmount one container with step-by-step escalation.

use appvault_runtime::escalator::TeardownOutcome;
use clap::Args;

use super::Context;
use crate::output::{BOLD, GREEN, RESET, YELLOW};
use crate::prompt::PromptConfirmation;

/// Arguments for the `unmount` command.
#[derive(Args, Debug)]
pub struct UnmountArgs {
    /// Container key.
    pub key: String,

    /// Force without asking if the normal unmount fails.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `unmount` command.
///
/// # Errors
///
/// Returns an error if the container stays mounted.
pub async fn execute(args: UnmountArgs, ctx: &Context) -> anyhow::Result<()> {
    let container = ctx.container(&args.key)?;
    if !ctx.volumes.is_mounted(&container).await {
        eprintln!("  {BOLD}{}{RESET} is not mounted.", container.key);
        return Ok(());
    }
    let confirmation = PromptConfirmation::new(args.force || ctx.assume_yes);
    let outcome = ctx.escalator.teardown(&container, &confirmation).await?;
    match outcome {
        TeardownOutcome::Unforced => {
            eprintln!("  {GREEN}Unmounted{RESET} {BOLD}{}{RESET}", container.key);
        }
        TeardownOutcome::AfterGracefulTermination => eprintln!(
            "  {GREEN}Unmounted{RESET} {BOLD}{}{RESET} after quitting its application",
            container.key
        ),
        TeardownOutcome::Forced => eprintln!(
            "  {YELLOW}Force-unmounted{RESET} {BOLD}{}{RESET}",
            container.key
        ),
    }
    Ok(())
}

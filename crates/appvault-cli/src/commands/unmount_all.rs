//! `avlt unmount-all` — Unmount every container through the escalation stages.

use appvault_common::types::ContainerKey;
use appvault_runtime::escalator::{SessionOptions, Stage};
use clap::Args;

use super::Context;
use crate::output::{BOLD, CYAN, DIM, GREEN, RED, RESET, YELLOW};
use crate::prompt::PromptConfirmation;

/// Arguments for the `unmount-all` command.
#[derive(Args, Debug)]
pub struct UnmountAllArgs {
    /// Also eject the storage drive if it is external.
    #[arg(long)]
    pub eject_drive: bool,
}

/// Executes the `unmount-all` command.
///
/// # Errors
///
/// Returns an error if applications are still running, a forced unmount
/// fails, or the storage root cannot be read.
pub async fn execute(args: UnmountAllArgs, ctx: &Context) -> anyhow::Result<()> {
    let containers = ctx.layout.discover()?;
    eprintln!();
    eprintln!(
        "  {BOLD}Unmounting{RESET} {CYAN}{}{RESET} container(s)",
        containers.len()
    );

    let options = SessionOptions {
        eject_storage_drive: args.eject_drive,
    };
    let confirmation = PromptConfirmation::new(ctx.assume_yes);
    let session = ctx.escalator.run(containers, options, &confirmation).await;

    match session.stage() {
        Stage::Done(report) => {
            eprintln!("  {GREEN}✓{RESET} {} unmounted", report.unmounted);
            if !report.failed.is_empty() {
                let failed: Vec<&str> = report.failed.iter().map(ContainerKey::as_str).collect();
                eprintln!("  {YELLOW}!{RESET} needed force: {}", failed.join(", "));
            }
            if let Some(drive) = &report.ejected_drive {
                eprintln!("  {GREEN}✓{RESET} ejected {BOLD}{drive}{RESET}");
            }
            eprintln!();
            Ok(())
        }
        Stage::Blocked { running } => {
            eprintln!("  {RED}✗{RESET} quit these applications first:");
            for key in running {
                eprintln!("      {key}");
            }
            anyhow::bail!("{} application(s) still running", running.len())
        }
        Stage::Cancelled => {
            eprintln!(
                "  {DIM}Cancelled. {} unmounted, {} left mounted.{RESET}",
                session.succeeded_count(),
                session.pending_containers().len()
            );
            for failure in session.failures() {
                eprintln!("      {failure}");
            }
            Ok(())
        }
        Stage::Failed { message } => anyhow::bail!("unmount failed: {message}"),
        other => anyhow::bail!("unmount stopped at stage {}", other.name()),
    }
}

//! `avlt watch-install` — Wait until the host finishes installing an app.

use std::sync::Arc;

use appvault_common::guard::CriticalOperations;
use appvault_common::types::ContainerKey;
use appvault_runtime::watcher::{InstallOutcome, InstallationWatcher};
use clap::Args;

use super::Context;
use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW};

/// Arguments for the `watch-install` command.
#[derive(Args, Debug)]
pub struct WatchInstallArgs {
    /// Bundle identifier of the application being installed.
    pub key: String,
}

/// Executes the `watch-install` command.
///
/// # Errors
///
/// Returns an error if the host crashed during the install or the process
/// table cannot be read.
pub async fn execute(args: WatchInstallArgs, ctx: &Context) -> anyhow::Result<()> {
    let key = ContainerKey::new(&args.key)?;
    let watcher = InstallationWatcher::new(
        Arc::clone(&ctx.runner),
        Arc::clone(&ctx.clock),
        ctx.config.tools.clone(),
        ctx.config.watcher.clone(),
        ctx.critical.clone(),
    );
    eprintln!("  {BOLD}Watching{RESET} install of {key}");

    let outcome = tokio::select! {
        outcome = watcher.watch(&key, |status| eprintln!("  {DIM}{status}{RESET}")) => outcome?,
        () = interrupted(&ctx.critical) => anyhow::bail!("interrupted"),
    };
    match outcome {
        InstallOutcome::Completed | InstallOutcome::CompletedAfterHostExit => {
            eprintln!("  {GREEN}Installed{RESET} {BOLD}{key}{RESET}");
        }
        InstallOutcome::Unconfirmed { waited } => {
            eprintln!(
                "  {YELLOW}Not confirmed{RESET} after {}s; the install may still have succeeded.",
                waited.as_secs()
            );
        }
    }
    Ok(())
}

/// Resolves on Ctrl+C. While a critical operation runs, the first press
/// only warns and a second one is needed.
async fn interrupted(critical: &CriticalOperations) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        if !critical.is_active() {
            return;
        }
        eprintln!(
            "  {YELLOW}Busy:{RESET} {}. Press Ctrl+C again to abort anyway.",
            critical.descriptions().join(", ")
        );
        if tokio::signal::ctrl_c().await.is_ok() {
            return;
        }
    }
}

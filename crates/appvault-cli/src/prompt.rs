//! Interactive confirmation of force escalations and data-handling choices.

use std::path::Path;

use anyhow::Context as _;
use appvault_common::types::{ContainerKey, InternalDataStrategy};
use appvault_runtime::confirm::{EjectFailure, ForceConfirmation};
use async_trait::async_trait;
use dialoguer::{Confirm, Select};
use dialoguer::theme::ColorfulTheme;

/// Asks on the terminal before every destructive step. With `assume_yes`
/// every prompt is answered yes without asking.
#[derive(Debug, Clone, Copy)]
pub struct PromptConfirmation {
    assume_yes: bool,
}

impl PromptConfirmation {
    pub const fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }

    async fn ask(&self, question: String) -> bool {
        if self.assume_yes {
            tracing::info!(question = %question, "confirmed by --yes");
            return true;
        }
        let answer = tokio::task::spawn_blocking(move || {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(question)
                .default(false)
                .interact()
        })
        .await;
        match answer {
            Ok(Ok(yes)) => yes,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "prompt failed, treating as declined");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "prompt task failed, treating as declined");
                false
            }
        }
    }
}

/// Asks what to do with `entries` files found in the unmounted mount point
/// `path`. With `assume_yes` the files are merged into the image, which
/// keeps them.
pub async fn choose_internal_data(
    key: &ContainerKey,
    path: &Path,
    entries: usize,
    assume_yes: bool,
) -> anyhow::Result<InternalDataStrategy> {
    if assume_yes {
        tracing::info!(key = %key, entries, "merging internal data (--yes)");
        return Ok(InternalDataStrategy::MergeThenDelete);
    }
    let question = format!(
        "{key} has {entries} item(s) in {} that mounting would hide. What should happen to them?",
        path.display()
    );
    let items: Vec<String> = InternalDataStrategy::ALL
        .iter()
        .map(|s| format!("{:<18} {}", s.as_str(), s.describe()))
        .collect();
    let index = tokio::task::spawn_blocking(move || {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt(question)
            .items(&items)
            .default(0)
            .interact()
    })
    .await
    .context("prompt task failed")?
    .context("reading the data-handling choice")?;
    InternalDataStrategy::ALL
        .get(index)
        .copied()
        .context("no such choice")
}

fn force_unmount_question(failed: &[EjectFailure]) -> String {
    let described: Vec<String> = failed.iter().map(ToString::to_string).collect();
    format!(
        "Could not eject {}. Force the unmount? Unsaved data may be lost",
        described.join(", ")
    )
}

#[async_trait]
impl ForceConfirmation for PromptConfirmation {
    async fn confirm_force_unmount(&self, failed: &[EjectFailure]) -> bool {
        self.ask(force_unmount_question(failed)).await
    }

    async fn confirm_force_eject(&self, drive: &str) -> bool {
        self.ask(format!("Drive {drive} is busy. Force eject it?")).await
    }

    async fn confirm_force_terminate(&self, key: &ContainerKey) -> bool {
        self.ask(format!("{key} is still running. Kill it and force the unmount?"))
            .await
    }
}

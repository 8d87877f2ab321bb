//! Registry of background per-container auto-unmount tasks.
//!
//! Tasks are spawned when an application exits and unmount its container in
//! the background. A mass unmount must cancel and await all of them before
//! it touches any container so two paths never unmount the same volume.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appvault_common::types::ContainerKey;
use tokio::task::JoinHandle;

type Table = HashMap<ContainerKey, JoinHandle<()>>;

/// Shared handle to the task registry.
#[derive(Debug, Clone, Default)]
pub struct AutoUnmountTasks {
    tasks: Arc<Mutex<Table>>,
}

impl AutoUnmountTasks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `task` for `key`, aborting any earlier task for the same key.
    pub fn spawn<F>(&self, key: ContainerKey, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut table = self.table();
        table.retain(|_, handle| !handle.is_finished());
        let handle = tokio::spawn(task);
        if let Some(previous) = table.insert(key.clone(), handle) {
            previous.abort();
            tracing::debug!(key = %key, "replaced auto-unmount task");
        } else {
            tracing::debug!(key = %key, "auto-unmount task registered");
        }
    }

    /// Aborts the task for `key` and waits for it to stop. Returns whether a
    /// task was registered.
    pub async fn cancel(&self, key: &ContainerKey) -> bool {
        let handle = self.table().remove(key);
        let Some(handle) = handle else {
            return false;
        };
        handle.abort();
        let _ = handle.await;
        true
    }

    /// Aborts every task and waits for all of them to stop. Returns how many
    /// were still running.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        let mut cancelled = 0;
        for (key, handle) in drained {
            if !handle.is_finished() {
                cancelled += 1;
            }
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(key = %key, error = %e, "auto-unmount task failed");
                }
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled auto-unmount tasks");
        }
        cancelled
    }

    /// Keys with a task that has not finished yet.
    pub fn active_keys(&self) -> Vec<ContainerKey> {
        let mut keys: Vec<_> = self
            .table()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

//! Tracking of operations that must not be interrupted by shutdown.
//!
//! A [`CriticalOperations`] handle is cloned into every component that can
//! start such an operation and into whatever handles shutdown requests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    active: BTreeMap<u64, String>,
}

/// Shared registry of in-flight critical operations.
#[derive(Debug, Clone, Default)]
pub struct CriticalOperations {
    inner: Arc<Mutex<Registry>>,
}

impl CriticalOperations {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an operation as started. It ends when the guard is dropped.
    pub fn begin(&self, description: impl Into<String>) -> CriticalOperationGuard {
        let description = description.into();
        let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = reg.next_id;
        reg.next_id += 1;
        tracing::debug!(id, operation = %description, "critical operation started");
        let _ = reg.active.insert(id, description);
        CriticalOperationGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Whether any operation is in flight.
    pub fn is_active(&self) -> bool {
        !self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .is_empty()
    }

    /// Descriptions of the in-flight operations, oldest first.
    pub fn descriptions(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .values()
            .cloned()
            .collect()
    }
}

/// Keeps an operation registered while alive.
#[derive(Debug)]
#[must_use = "the operation ends as soon as the guard is dropped"]
pub struct CriticalOperationGuard {
    inner: Arc<Mutex<Registry>>,
    id: u64,
}

impl Drop for CriticalOperationGuard {
    fn drop(&mut self) {
        let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(description) = reg.active.remove(&self.id) {
            tracing::debug!(id = self.id, operation = %description, "critical operation finished");
        }
    }
}

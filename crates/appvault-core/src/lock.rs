//! Per-container advisory locks.
//!
//! Each lock is an exclusive `flock` on a hidden sentinel file inside the
//! container's mount point. The table of held locks is private to the
//! coordinator and every access goes through its mutex, so two `lock` calls
//! can never both succeed for one container. Contention is reported as
//! `false`, never as an error.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use appvault_common::constants::LOCK_FILE_NAME;
use appvault_common::types::{Container, ContainerKey};
use nix::fcntl::{Flock, FlockArg};

/// Sentinel file path for a container.
#[must_use]
pub fn sentinel_path(container: &Container) -> PathBuf {
    container.mount_point.join(LOCK_FILE_NAME)
}

struct HeldLock {
    lock: Flock<File>,
    path: PathBuf,
}

/// Registry of the advisory locks held by this instance.
#[derive(Default)]
pub struct LockCoordinator {
    held: Mutex<HashMap<ContainerKey, HeldLock>>,
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("held", &self.held_keys())
            .finish()
    }
}

/// Takes a non-blocking exclusive lock on an open file.
fn try_flock(file: File, path: &Path) -> Option<Flock<File>> {
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Some(lock),
        Err((_file, errno)) => {
            tracing::debug!(path = %path.display(), %errno, "sentinel locked elsewhere");
            None
        }
    }
}

fn release(key: &ContainerKey, held: HeldLock) {
    if let Err((_lock, errno)) = held.lock.unlock() {
        tracing::warn!(key = %key, path = %held.path.display(), %errno, "explicit unlock failed, closing handle");
    }
}

impl LockCoordinator {
    /// Creates a coordinator holding no locks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ContainerKey, HeldLock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the container's lock. Returns `true` if this coordinator now
    /// holds it (including when it already did) and `false` if another
    /// holder has it or the sentinel cannot be opened.
    ///
    /// The mount point must already exist, i.e. the container is mounted
    /// first; a missing mount point yields `false` without creating
    /// anything on the host filesystem.
    pub fn lock(&self, container: &Container) -> bool {
        let mut table = self.table();
        if table.contains_key(&container.key) {
            return true;
        }
        if !container.mount_point.is_dir() {
            tracing::warn!(key = %container.key, path = %container.mount_point.display(), "no mount point, not locking");
            return false;
        }
        let path = sentinel_path(container);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(key = %container.key, path = %path.display(), error = %e, "cannot open lock sentinel");
                return false;
            }
        };
        let Some(lock) = try_flock(file, &path) else {
            return false;
        };
        tracing::info!(key = %container.key, "lock acquired");
        let _ = table.insert(container.key.clone(), HeldLock { lock, path });
        true
    }

    /// Releases the container's lock if held; no-op otherwise.
    pub fn unlock(&self, container: &Container) {
        let removed = self.table().remove(&container.key);
        if let Some(held) = removed {
            release(&container.key, held);
            tracing::info!(key = %container.key, "lock released");
        }
    }

    /// Whether [`Self::lock`] would currently succeed, without keeping the
    /// lock. A missing sentinel means nobody holds it.
    pub fn can_lock(&self, container: &Container) -> bool {
        let table = self.table();
        if table.contains_key(&container.key) {
            return true;
        }
        let path = sentinel_path(container);
        if !path.exists() {
            return true;
        }
        let Ok(file) = File::open(&path) else {
            return false;
        };
        try_flock(file, &path).is_some()
    }

    /// Whether this coordinator holds the container's lock.
    pub fn is_held(&self, key: &ContainerKey) -> bool {
        self.table().contains_key(key)
    }

    /// Keys of every lock this coordinator holds, sorted.
    pub fn held_keys(&self) -> Vec<ContainerKey> {
        let mut keys: Vec<_> = self.table().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Releases every held lock.
    pub fn release_all(&self) {
        let drained: Vec<_> = self.table().drain().collect();
        for (key, held) in drained {
            release(&key, held);
        }
    }

    /// Removes sentinel files left behind by crashed holders. A sentinel is
    /// removed only when it can be locked, i.e. no live process holds it;
    /// sentinels held by this coordinator are skipped. Returns how many
    /// sentinels were removed.
    pub fn cleanup_stale<'a>(&self, containers: impl IntoIterator<Item = &'a Container>) -> usize {
        let table = self.table();
        let mut removed = 0;
        for container in containers {
            if table.contains_key(&container.key) {
                continue;
            }
            let path = sentinel_path(container);
            if !path.exists() {
                continue;
            }
            let Ok(file) = File::open(&path) else {
                continue;
            };
            let Some(lock) = try_flock(file, &path) else {
                continue;
            };
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(key = %container.key, path = %path.display(), "removed stale lock");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(key = %container.key, error = %e, "cannot remove stale lock");
                }
            }
            drop(lock);
        }
        removed
    }
}

impl Drop for LockCoordinator {
    fn drop(&mut self) {
        self.release_all();
    }
}

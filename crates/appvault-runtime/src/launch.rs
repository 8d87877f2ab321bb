//! Launch preparation and post-exit unmounting.

use std::sync::Arc;
use std::time::Duration;

use appvault_common::error::{Result, VaultError};
use appvault_common::types::{Container, InternalDataStrategy};
use appvault_core::lock::LockCoordinator;
use appvault_core::volume::VolumeManager;

use crate::escalator::{SafeUnmount, UnmountEscalator};
use crate::internal_data;

/// How long [`watch_exit_and_unmount`] waits for the application to appear
/// before giving up without unmounting.
pub const STARTUP_GRACE: Duration = Duration::from_secs(30);

/// Mounts the container if it is not mounted yet.
///
/// Files already sitting in the unmounted mount point are handled with
/// `internal_data` before the image is attached over them. Without a
/// strategy the mount is refused and nothing is touched.
///
/// # Errors
///
/// Returns [`VaultError::MountFailed`] if the disk image does not exist yet
/// or cannot be attached, and [`VaultError::InternalDataPresent`] if files
/// were found and `internal_data` is `None`.
pub async fn prepare_mount(
    volumes: &VolumeManager,
    container: &Container,
    nobrowse: bool,
    internal_data: Option<InternalDataStrategy>,
) -> Result<()> {
    if !container.image_path.exists() {
        return Err(VaultError::MountFailed {
            key: container.key.to_string(),
            stderr: format!(
                "no disk image at {}; create the container first",
                container.image_path.display()
            ),
        });
    }
    if volumes.is_mounted(container).await {
        tracing::debug!(key = %container.key, "already mounted");
        return Ok(());
    }
    let items = internal_data::detect_internal_data(container)?;
    if !items.is_empty() {
        let Some(strategy) = internal_data else {
            tracing::warn!(key = %container.key, entries = items.len(), "internal data found, refusing to mount over it");
            return Err(VaultError::InternalDataPresent {
                key: container.key.to_string(),
                path: container.mount_point.clone(),
                entries: items.len(),
            });
        };
        internal_data::handle_internal_data(volumes, container, &items, strategy).await?;
    }
    volumes.mount(container, nobrowse).await
}

/// Mounts the container (see [`prepare_mount`]) and takes its lock before
/// launching the owning application. Returns whether this instance holds
/// the lock; a `false` means another process already does, which does not
/// prevent the launch.
///
/// # Errors
///
/// Same as [`prepare_mount`].
pub async fn prepare_launch(
    volumes: &VolumeManager,
    locks: &LockCoordinator,
    container: &Container,
    nobrowse: bool,
    internal_data: Option<InternalDataStrategy>,
) -> Result<bool> {
    prepare_mount(volumes, container, nobrowse, internal_data).await?;
    let locked = locks.lock(container);
    if !locked {
        tracing::info!(key = %container.key, "container locked by another process");
    }
    Ok(locked)
}

/// Registers a background task that waits for the container's application
/// to start and then exit, and then unmounts the container safely. Only a
/// confirmed "not running" after a confirmed "running" counts as an exit.
///
/// The task is tracked in the escalator's auto-unmount registry so a mass
/// unmount can cancel it first.
pub fn watch_exit_and_unmount(escalator: &Arc<UnmountEscalator>, container: Container, poll: Duration) {
    let task_escalator = Arc::clone(escalator);
    let key = container.key.clone();
    escalator.tasks().spawn(key, async move {
        let escalator = task_escalator;
        let clock = escalator.clock();
        let lifecycle = escalator.lifecycle();
        let start = clock.now();
        let mut seen = false;
        loop {
            match lifecycle.is_running(&container.key).await {
                Ok(true) => seen = true,
                Ok(false) if seen => break,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %container.key, error = %e, "liveness unknown, not treating as exit");
                }
            }
            if !seen && clock.now().saturating_sub(start) >= STARTUP_GRACE {
                tracing::warn!(key = %container.key, "application never started, keeping container mounted");
                return;
            }
            clock.sleep(poll).await;
        }
        match escalator.unmount_safely(&container).await {
            Ok(SafeUnmount::Unmounted) => {}
            Ok(outcome) => tracing::info!(key = %container.key, ?outcome, "auto-unmount skipped"),
            Err(e) => tracing::warn!(key = %container.key, error = %e, "auto-unmount failed"),
        }
    });
}

//! Multi-stage unmount escalation.
//!
//! A mass unmount is an [`UnmountSession`] that moves through the stages
//!
//! ```text
//! Check ─┬─> Blocked
//!        └─> NormalEject ─┬─> OfferForce ──(confirm)──> ForceEject ─┐
//!                         └────────────────────────────────────────┴─> DriveEject ─┬─> Done
//!                                                                                   └─> OfferForceEject ──(confirm)──> DriveEject
//! ```
//!
//! Containers are processed one at a time. Before every eject the owning
//! application's preferences are flushed, the filesystem is synced, and the
//! escalator waits for the settle delay. Forced operations only ever follow
//! an explicit confirmation.

use std::sync::Arc;

use appvault_common::config::EscalationConfig;
use appvault_common::error::{Result, VaultError};
use appvault_common::types::{Container, ContainerKey};
use appvault_core::lock::LockCoordinator;
use appvault_core::volume::VolumeManager;

use crate::autounmount::AutoUnmountTasks;
use crate::clock::Clock;
use crate::confirm::{EjectFailure, ForceConfirmation};
use crate::lifecycle::{AppLifecycle, TerminationMode};

/// Result of a completed mass unmount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmountReport {
    /// Containers actually ejected by this session.
    pub unmounted: usize,
    /// Containers whose eject failed at least once, even if a forced retry
    /// later succeeded.
    pub failed: Vec<ContainerKey>,
    /// Display name of the storage drive, if it was ejected.
    pub ejected_drive: Option<String>,
}

/// Stage of an [`UnmountSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Checking whether any owning application is still running. A
    /// container whose application state cannot be determined fails the
    /// session before anything is ejected.
    Check,
    /// Applications are running; nothing was touched.
    Blocked {
        /// Containers whose application is running.
        running: Vec<ContainerKey>,
    },
    /// Unforced eject of each container.
    NormalEject,
    /// Waiting for confirmation to force the remaining containers.
    OfferForce {
        /// Containers whose unforced eject failed.
        failed: Vec<ContainerKey>,
    },
    /// Forced eject of every container still pending.
    ForceEject,
    /// Ejecting the drive that holds the storage root.
    DriveEject,
    /// Waiting for confirmation to force-eject the drive.
    OfferForceEject {
        /// Device node of the drive.
        device: String,
        /// Human-readable drive name.
        display_name: String,
    },
    /// Finished successfully.
    Done(UnmountReport),
    /// Finished with an unrecoverable failure.
    Failed {
        /// What went wrong.
        message: String,
    },
    /// Cancelled by the user before any forced step.
    Cancelled,
}

impl Stage {
    /// Whether the session has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed { .. } | Self::Cancelled)
    }

    /// Whether the session is waiting for [`UnmountSession::confirm`] or
    /// [`UnmountSession::cancel`].
    #[must_use]
    pub const fn awaits_decision(&self) -> bool {
        matches!(
            self,
            Self::Blocked { .. } | Self::OfferForce { .. } | Self::OfferForceEject { .. }
        )
    }

    /// Short label for logs and progress output.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Blocked { .. } => "blocked",
            Self::NormalEject => "normal-eject",
            Self::OfferForce { .. } => "offer-force",
            Self::ForceEject => "force-eject",
            Self::DriveEject => "drive-eject",
            Self::OfferForceEject { .. } => "offer-force-eject",
            Self::Done(_) => "done",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Per-session choices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Also eject the drive holding the storage root when it is external.
    pub eject_storage_drive: bool,
}

/// State of one mass unmount.
#[derive(Debug, Clone)]
pub struct UnmountSession {
    stage: Stage,
    pending: Vec<Container>,
    succeeded: usize,
    failed: Vec<ContainerKey>,
    failures: Vec<EjectFailure>,
    options: SessionOptions,
    force_drive: bool,
    ejected_drive: Option<String>,
}

impl UnmountSession {
    fn new(containers: Vec<Container>, options: SessionOptions) -> Self {
        Self {
            stage: Stage::Check,
            pending: containers,
            succeeded: 0,
            failed: Vec::new(),
            failures: Vec::new(),
            options,
            force_drive: false,
            ejected_drive: None,
        }
    }

    /// Current stage.
    #[must_use]
    pub const fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Containers ejected so far.
    #[must_use]
    pub const fn succeeded_count(&self) -> usize {
        self.succeeded
    }

    /// Containers whose eject failed so far.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Containers not yet ejected.
    #[must_use]
    pub fn pending_containers(&self) -> &[Container] {
        &self.pending
    }

    /// Why each failed container's unforced eject was refused.
    #[must_use]
    pub fn failures(&self) -> &[EjectFailure] {
        &self.failures
    }

    /// Accepts the pending force offer. Returns `false` when the session is
    /// not waiting for one.
    pub fn confirm(&mut self) -> bool {
        match self.stage {
            Stage::OfferForce { .. } => self.stage = Stage::ForceEject,
            Stage::OfferForceEject { .. } => {
                self.force_drive = true;
                self.stage = Stage::DriveEject;
            }
            _ => return false,
        }
        tracing::info!(stage = self.stage.name(), "force escalation confirmed");
        true
    }

    /// Cancels the session. Only possible before a destructive stage starts;
    /// returns whether the session was cancelled.
    pub fn cancel(&mut self) -> bool {
        if !self.stage.awaits_decision() {
            return false;
        }
        tracing::info!(stage = self.stage.name(), "unmount session cancelled");
        self.stage = Stage::Cancelled;
        true
    }

    /// Goes back to [`Stage::Check`] from [`Stage::Blocked`], e.g. after the
    /// user quit the running applications.
    pub fn retry(&mut self) -> bool {
        if !matches!(self.stage, Stage::Blocked { .. }) {
            return false;
        }
        self.stage = Stage::Check;
        true
    }

    fn finish(&mut self) {
        self.stage = Stage::Done(UnmountReport {
            unmounted: self.succeeded,
            failed: self.failed.clone(),
            ejected_drive: self.ejected_drive.take(),
        });
    }

    fn after_containers(&mut self) {
        if self.options.eject_storage_drive {
            self.stage = Stage::DriveEject;
        } else {
            self.finish();
        }
    }
}

/// Outcome of [`UnmountEscalator::teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The first unforced eject succeeded.
    Unforced,
    /// Succeeded after the application was asked to quit.
    AfterGracefulTermination,
    /// Required a forced eject.
    Forced,
}

/// Outcome of [`UnmountEscalator::unmount_safely`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeUnmount {
    /// The container was ejected.
    Unmounted,
    /// Nothing was mounted.
    NotMounted,
    /// Another process holds the container's lock; left mounted.
    HeldElsewhere,
}

/// Drives unmount sessions and single-container teardown.
pub struct UnmountEscalator {
    volumes: Arc<VolumeManager>,
    locks: Arc<LockCoordinator>,
    lifecycle: Arc<dyn AppLifecycle>,
    clock: Arc<dyn Clock>,
    tasks: AutoUnmountTasks,
    config: EscalationConfig,
}

impl std::fmt::Debug for UnmountEscalator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmountEscalator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UnmountEscalator {
    /// Creates an escalator over the given collaborators.
    pub fn new(
        volumes: Arc<VolumeManager>,
        locks: Arc<LockCoordinator>,
        lifecycle: Arc<dyn AppLifecycle>,
        clock: Arc<dyn Clock>,
        tasks: AutoUnmountTasks,
    ) -> Self {
        let config = volumes.config().escalation.clone();
        Self {
            volumes,
            locks,
            lifecycle,
            clock,
            tasks,
            config,
        }
    }

    /// Volume manager in use.
    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volumes
    }

    /// Lock coordinator in use.
    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    /// Application lifecycle in use.
    pub fn lifecycle(&self) -> &Arc<dyn AppLifecycle> {
        &self.lifecycle
    }

    /// Clock in use.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Auto-unmount task registry in use.
    pub const fn tasks(&self) -> &AutoUnmountTasks {
        &self.tasks
    }

    /// Starts a session for `containers` at [`Stage::Check`].
    #[must_use]
    pub fn begin(&self, containers: Vec<Container>, options: SessionOptions) -> UnmountSession {
        tracing::info!(containers = containers.len(), ?options, "unmount session started");
        UnmountSession::new(containers, options)
    }

    /// Runs a whole session, asking `confirmation` at every force offer.
    /// Returns the session in a terminal stage or in [`Stage::Blocked`].
    pub async fn run(
        &self,
        containers: Vec<Container>,
        options: SessionOptions,
        confirmation: &dyn ForceConfirmation,
    ) -> UnmountSession {
        let mut session = self.begin(containers, options);
        loop {
            match session.stage() {
                Stage::Blocked { .. } => break,
                Stage::OfferForce { .. } => {
                    if confirmation.confirm_force_unmount(session.failures()).await {
                        let _ = session.confirm();
                    } else {
                        let _ = session.cancel();
                    }
                }
                Stage::OfferForceEject { display_name, .. } => {
                    if confirmation.confirm_force_eject(display_name).await {
                        let _ = session.confirm();
                    } else {
                        let _ = session.cancel();
                    }
                }
                stage if stage.is_terminal() => break,
                _ => self.advance(&mut session).await,
            }
        }
        session
    }

    /// Executes the current stage and moves to the next. Does nothing while
    /// the session awaits a decision or has finished.
    pub async fn advance(&self, session: &mut UnmountSession) {
        match session.stage {
            Stage::Check => self.check(session).await,
            Stage::NormalEject => self.normal_eject(session).await,
            Stage::ForceEject => self.force_eject(session).await,
            Stage::DriveEject => self.drive_eject(session).await,
            _ => return,
        }
        tracing::debug!(
            stage = session.stage.name(),
            succeeded = session.succeeded,
            failed = session.failed.len(),
            "unmount session advanced"
        );
    }

    async fn check(&self, session: &mut UnmountSession) {
        let _ = self.tasks.cancel_all().await;
        let mut running = Vec::new();
        for container in &session.pending {
            match self.lifecycle.is_running(&container.key).await {
                Ok(true) => running.push(container.key.clone()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %container.key, error = %e, "liveness unknown, refusing to eject");
                    session.stage = Stage::Failed {
                        message: format!("cannot tell whether {} is running: {e}", container.key),
                    };
                    return;
                }
            }
        }
        if running.is_empty() {
            session.stage = Stage::NormalEject;
        } else {
            tracing::warn!(running = ?running, "unmount blocked by running applications");
            session.stage = Stage::Blocked { running };
        }
    }

    async fn normal_eject(&self, session: &mut UnmountSession) {
        let containers = std::mem::take(&mut session.pending);
        let mut remaining = containers.into_iter();
        while let Some(container) = remaining.next() {
            self.locks.unlock(&container);
            if !self.volumes.is_mounted(&container).await {
                tracing::debug!(key = %container.key, "not mounted, skipping");
                continue;
            }
            self.prepare(&container.key).await;
            match self.volumes.eject(&container, false).await {
                Ok(()) => session.succeeded += 1,
                Err(e) => {
                    tracing::warn!(key = %container.key, error = %e, "eject failed");
                    session.failed.push(container.key.clone());
                    session.failures.push(EjectFailure::new(container.key.clone(), &e));
                    session.pending.push(container);
                    session.pending.extend(remaining);
                    session.stage = Stage::OfferForce {
                        failed: session.failed.clone(),
                    };
                    return;
                }
            }
        }
        session.after_containers();
    }

    async fn force_eject(&self, session: &mut UnmountSession) {
        let containers = std::mem::take(&mut session.pending);
        let mut errors = Vec::new();
        for container in containers {
            self.locks.unlock(&container);
            if !self.volumes.is_mounted(&container).await {
                continue;
            }
            self.prepare(&container.key).await;
            match self.volumes.eject(&container, true).await {
                Ok(()) => session.succeeded += 1,
                Err(e) => {
                    tracing::warn!(key = %container.key, error = %e, "forced eject failed");
                    if !session.failed.contains(&container.key) {
                        session.failed.push(container.key.clone());
                    }
                    errors.push(format!("{}: {e}", container.key));
                    session.pending.push(container);
                }
            }
        }
        if errors.is_empty() {
            session.after_containers();
        } else {
            session.stage = Stage::Failed {
                message: errors.join("; "),
            };
        }
    }

    async fn drive_eject(&self, session: &mut UnmountSession) {
        let storage_root = &self.volumes.config().storage_root;
        if !self.volumes.is_external_drive(storage_root).await {
            tracing::debug!(path = %storage_root.display(), "storage root is internal, keeping drive");
            session.finish();
            return;
        }
        let Some(device) = self.volumes.device_path(storage_root).await else {
            session.stage = Stage::Failed {
                message: VaultError::DeviceResolutionFailed {
                    path: storage_root.clone(),
                }
                .to_string(),
            };
            return;
        };
        let display_name = self
            .volumes
            .volume_info(storage_root)
            .await
            .map_or_else(|| device.clone(), |info| info.display_name());
        let force = session.force_drive;
        match self.volumes.eject_drive(&device, force).await {
            Ok(()) => {
                session.ejected_drive = Some(display_name);
                session.finish();
            }
            Err(e) if !force => {
                tracing::warn!(device = %device, error = %e, "drive eject failed");
                session.stage = Stage::OfferForceEject {
                    device,
                    display_name,
                };
            }
            Err(e) => {
                session.stage = Stage::Failed {
                    message: e.to_string(),
                };
            }
        }
    }

    /// Flushes preferences, syncs the filesystem, and waits the settle delay.
    async fn prepare(&self, key: &ContainerKey) {
        self.lifecycle.sync_preferences(key).await;
        if let Err(e) = tokio::task::spawn_blocking(nix::unistd::sync).await {
            tracing::warn!(error = %e, "filesystem sync did not complete");
        }
        self.clock.sleep(self.config.settle_delay()).await;
    }

    /// Unmounts one container, escalating step by step: unforced eject; if
    /// the application is running, graceful termination, grace wait, and
    /// another unforced eject; then, only after confirmation, forceful
    /// termination, a shorter wait, and a forced eject.
    ///
    /// # Errors
    ///
    /// Returns the last eject error if every step failed or the force step
    /// was declined, and the liveness error if the application's state
    /// cannot be determined after the first eject failed.
    pub async fn teardown(
        &self,
        container: &Container,
        confirmation: &dyn ForceConfirmation,
    ) -> Result<TeardownOutcome> {
        let key = &container.key;
        self.locks.unlock(container);
        self.prepare(key).await;
        let Err(first) = self.volumes.eject(container, false).await else {
            return Ok(TeardownOutcome::Unforced);
        };
        tracing::warn!(key = %key, error = %first, "unforced eject failed, escalating");

        let mut last = first;
        if self.lifecycle.is_running(key).await? {
            let _ = self.lifecycle.terminate(key, TerminationMode::Graceful).await?;
            self.clock.sleep(self.config.graceful_grace()).await;
            self.prepare(key).await;
            match self.volumes.eject(container, false).await {
                Ok(()) => return Ok(TeardownOutcome::AfterGracefulTermination),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "eject after graceful termination failed");
                    last = e;
                }
            }
        }

        let running = self.lifecycle.is_running(key).await?;
        let confirmed = if running {
            confirmation.confirm_force_terminate(key).await
        } else {
            confirmation
                .confirm_force_unmount(&[EjectFailure::new(key.clone(), &last)])
                .await
        };
        if !confirmed {
            tracing::info!(key = %key, "force escalation declined");
            return Err(last);
        }
        if running {
            let _ = self.lifecycle.terminate(key, TerminationMode::Forceful).await?;
            self.clock.sleep(self.config.forceful_grace()).await;
        }
        self.prepare(key).await;
        self.volumes.eject(container, true).await?;
        Ok(TeardownOutcome::Forced)
    }

    /// Unmounts a container after its application exited, unless another
    /// process still holds its lock.
    ///
    /// # Errors
    ///
    /// Returns the eject error if the unforced eject fails.
    pub async fn unmount_safely(&self, container: &Container) -> Result<SafeUnmount> {
        self.locks.unlock(container);
        if !self.volumes.is_mounted(container).await {
            return Ok(SafeUnmount::NotMounted);
        }
        if !self.locks.can_lock(container) {
            tracing::info!(key = %container.key, "lock held by another process, leaving mounted");
            return Ok(SafeUnmount::HeldElsewhere);
        }
        self.prepare(&container.key).await;
        self.volumes.eject(container, false).await?;
        tracing::info!(key = %container.key, "unmounted after exit");
        Ok(SafeUnmount::Unmounted)
    }
}

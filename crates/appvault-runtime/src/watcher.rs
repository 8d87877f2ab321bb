//! Completion detection for installs driven by the external host.
//!
//! The host gives no completion signal. Progress is inferred from the
//! modification time of the per-app settings file it writes, the host's
//! liveness, and, when the host exits early, the presence of a completion
//! marker inside the installed bundle.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use appvault_common::config::{ToolPaths, WatcherConfig};
use appvault_common::error::{Result, VaultError};
use appvault_common::guard::CriticalOperations;
use appvault_common::types::ContainerKey;
use appvault_core::process::{CommandRunner, CommandSpec};

use crate::bundle;
use crate::clock::Clock;
use crate::lifecycle::process_table;

/// Where an install currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    /// No update of the settings file seen yet.
    AwaitingFirstUpdate,
    /// One update seen, waiting for the second.
    AwaitingSecondUpdate,
    /// Checking that the settings file stopped changing.
    Stabilizing {
        /// How long it has been unchanged.
        stable: Duration,
        /// How long it must stay unchanged.
        threshold: Duration,
    },
}

impl fmt::Display for WatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingFirstUpdate => write!(f, "waiting for the host to start installing"),
            Self::AwaitingSecondUpdate => write!(f, "first settings update seen, waiting for the second"),
            Self::Stabilizing { stable, threshold } => write!(
                f,
                "verifying stability ({}s/{}s)",
                stable.as_secs(),
                threshold.as_secs()
            ),
        }
    }
}

/// Result of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Keep polling.
    Waiting(WatchPhase),
    /// The settings file has been stable long enough; completion depends on
    /// nobody holding it open for writing.
    Stable,
}

/// Pure detection state for one install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    /// Elapsed time at the latest sample.
    pub elapsed: Duration,
    /// Distinct modification-time changes seen.
    pub update_count: u32,
    /// Modification time at the latest sample.
    pub last_mtime: Option<SystemTime>,
    /// Modification time the stability window is measured against.
    pub last_stable_mtime: Option<SystemTime>,
    /// How long the modification time has stayed at `last_stable_mtime`.
    pub stable_duration: Duration,
    /// Elapsed time of the first change.
    pub first_update_time: Option<Duration>,
    stability_threshold: Duration,
    single_update_fallback: Duration,
}

impl InstallProgress {
    /// Starts tracking with `baseline` as the initial modification time
    /// (`None` if the settings file does not exist yet).
    #[must_use]
    pub fn new(config: &WatcherConfig, baseline: Option<SystemTime>) -> Self {
        Self {
            elapsed: Duration::ZERO,
            update_count: 0,
            last_mtime: baseline,
            last_stable_mtime: None,
            stable_duration: Duration::ZERO,
            first_update_time: None,
            stability_threshold: config.stability_threshold(),
            single_update_fallback: config.single_update_fallback(),
        }
    }

    /// Feeds one sample taken at `elapsed`.
    pub fn observe(&mut self, elapsed: Duration, mtime: Option<SystemTime>) -> Observation {
        let delta = elapsed.saturating_sub(self.elapsed);
        self.elapsed = elapsed;
        let Some(mtime) = mtime else {
            return Observation::Waiting(self.phase());
        };
        match self.last_mtime {
            Some(last) if last != mtime => {
                self.update_count += 1;
                if self.update_count == 1 {
                    self.first_update_time = Some(elapsed);
                }
                tracing::debug!(updates = self.update_count, ?elapsed, "settings file updated");
            }
            _ => {}
        }
        self.last_mtime = Some(mtime);

        let checking = self.update_count >= 2
            || (self.update_count == 1
                && self
                    .first_update_time
                    .is_some_and(|first| elapsed.saturating_sub(first) >= self.single_update_fallback));
        if !checking {
            return Observation::Waiting(self.phase());
        }
        if self.last_stable_mtime == Some(mtime) {
            self.stable_duration += delta;
            if self.stable_duration >= self.stability_threshold {
                return Observation::Stable;
            }
        } else {
            self.last_stable_mtime = Some(mtime);
            self.stable_duration = Duration::ZERO;
        }
        Observation::Waiting(self.phase())
    }

    /// Restarts the stability window after a writer was found.
    pub fn writer_active(&mut self) {
        self.stable_duration = Duration::ZERO;
    }

    fn phase(&self) -> WatchPhase {
        match (self.update_count, self.last_stable_mtime) {
            (0, _) => WatchPhase::AwaitingFirstUpdate,
            (1, None) => WatchPhase::AwaitingSecondUpdate,
            _ => WatchPhase::Stabilizing {
                stable: self.stable_duration,
                threshold: self.stability_threshold,
            },
        }
    }
}

/// How an install finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Stability detected with no writer holding the settings file.
    Completed,
    /// The host exited, but the completion marker is present.
    CompletedAfterHostExit,
    /// Neither confirmed nor refuted before the maximum wait. The install
    /// may well have succeeded.
    Unconfirmed {
        /// How long the watcher waited.
        waited: Duration,
    },
}

impl InstallOutcome {
    /// Whether completion was positively confirmed.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        !matches!(self, Self::Unconfirmed { .. })
    }

    /// Converts an unconfirmed outcome into [`VaultError::TimeoutUndetected`].
    ///
    /// # Errors
    ///
    /// Returns the timeout error for [`Self::Unconfirmed`].
    pub fn into_result(self, key: &ContainerKey) -> Result<Self> {
        match self {
            Self::Unconfirmed { waited } => Err(VaultError::TimeoutUndetected {
                key: key.to_string(),
                waited,
            }),
            other => Ok(other),
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Polls the host and its settings artifact until an install settles.
pub struct InstallationWatcher {
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    tools: ToolPaths,
    config: WatcherConfig,
    critical: CriticalOperations,
}

impl fmt::Debug for InstallationWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationWatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InstallationWatcher {
    /// Creates a watcher. Each watch registers itself in `critical` for its
    /// whole duration.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
        tools: ToolPaths,
        config: WatcherConfig,
        critical: CriticalOperations,
    ) -> Self {
        Self {
            runner,
            clock,
            tools,
            config,
            critical,
        }
    }

    /// Watches the install of `key`, reporting progress through `status`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::CrashedDuringOperation`] if the host exits
    /// without leaving a completed bundle, or an error if the process table
    /// cannot be read.
    pub async fn watch(
        &self,
        key: &ContainerKey,
        mut status: impl FnMut(&str) + Send,
    ) -> Result<InstallOutcome> {
        let _guard = self.critical.begin(format!("installing {key}"));
        let settings = self.config.settings_file(key);
        let mut progress = InstallProgress::new(&self.config, modified(&settings));
        let start = self.clock.now();
        tracing::info!(key = %key, settings = %settings.display(), "watching installation");

        loop {
            let elapsed = self.clock.now().saturating_sub(start);
            if elapsed >= self.config.max_wait() {
                tracing::warn!(key = %key, ?elapsed, "installation not confirmed in time");
                return Ok(InstallOutcome::Unconfirmed { waited: elapsed });
            }

            if !self.host_running().await? {
                if self.completion_marker_present(key).await {
                    tracing::info!(key = %key, "host exited, bundle complete");
                    status("installed (confirmed after the host exited)");
                    return Ok(InstallOutcome::CompletedAfterHostExit);
                }
                tracing::error!(key = %key, "host exited during installation");
                return Err(VaultError::CrashedDuringOperation {
                    key: key.to_string(),
                });
            }

            match progress.observe(elapsed, modified(&settings)) {
                Observation::Stable => {
                    if self.writer_active(&settings).await {
                        tracing::debug!(key = %key, "host still writing settings");
                        progress.writer_active();
                        status("host still writing, restarting stability check");
                    } else {
                        tracing::info!(key = %key, ?elapsed, "installation complete");
                        status("installed");
                        return Ok(InstallOutcome::Completed);
                    }
                }
                Observation::Waiting(phase) => status(&phase.to_string()),
            }

            self.clock.sleep(self.config.poll_interval()).await;
        }
    }

    async fn host_running(&self) -> Result<bool> {
        let needle = format!("{}.app", self.config.host_process_name);
        let table = process_table(self.runner.as_ref(), &self.tools.ps).await?;
        Ok(table.iter().any(|p| p.command.contains(&needle)))
    }

    async fn writer_active(&self, settings: &Path) -> bool {
        let spec = CommandSpec::new(&self.tools.lsof).path_arg(settings);
        self.runner
            .output(&spec)
            .await
            .is_ok_and(|out| out.stdout.contains(&self.config.host_process_name))
    }

    async fn completion_marker_present(&self, key: &ContainerKey) -> bool {
        bundle::find_installed_bundle(
            self.runner.as_ref(),
            &self.tools.defaults,
            &self.config.applications_dir,
            key,
        )
        .await
        .is_some_and(|b| b.join(&self.config.completion_marker).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn at(n: u64) -> Option<SystemTime> {
        Some(SystemTime::UNIX_EPOCH + secs(1_000 + n))
    }

    #[test]
    fn second_update_then_stability() {
        let mut p = InstallProgress::new(&WatcherConfig::default(), at(0));
        let samples = [
            (0, 0),
            (2, 0),
            (4, 0),
            (6, 5),
            (8, 5),
            (10, 10),
            (12, 10),
        ];
        for (elapsed, mtime) in samples {
            assert!(matches!(p.observe(secs(elapsed), at(mtime)), Observation::Waiting(_)));
        }
        assert_eq!(p.update_count, 2);
        assert_eq!(p.first_update_time, Some(secs(6)));
        assert_eq!(p.observe(secs(14), at(10)), Observation::Stable);
    }

    #[test]
    fn first_appearance_is_a_baseline() {
        let mut p = InstallProgress::new(&WatcherConfig::default(), None);
        let _ = p.observe(secs(2), None);
        let _ = p.observe(secs(4), at(4));
        assert_eq!(p.update_count, 0);
        let _ = p.observe(secs(6), at(6));
        assert_eq!(p.update_count, 1);
    }

    #[test]
    fn single_update_fallback_after_delay() {
        let mut p = InstallProgress::new(&WatcherConfig::default(), at(0));
        assert_eq!(
            p.observe(secs(2), at(1)),
            Observation::Waiting(WatchPhase::AwaitingSecondUpdate)
        );
        for t in [4, 6, 8] {
            assert_eq!(
                p.observe(secs(t), at(1)),
                Observation::Waiting(WatchPhase::AwaitingSecondUpdate)
            );
        }
        // fallback window opens at 2 + 8 = 10
        assert!(matches!(
            p.observe(secs(10), at(1)),
            Observation::Waiting(WatchPhase::Stabilizing { .. })
        ));
        let _ = p.observe(secs(12), at(1));
        assert_eq!(p.observe(secs(14), at(1)), Observation::Stable);
    }

    #[test]
    fn writer_resets_stability() {
        let mut p = InstallProgress::new(&WatcherConfig::default(), at(0));
        for (t, m) in [(2, 1), (4, 2), (6, 2)] {
            let _ = p.observe(secs(t), at(m));
        }
        assert_eq!(p.observe(secs(8), at(2)), Observation::Stable);
        p.writer_active();
        assert!(matches!(p.observe(secs(10), at(2)), Observation::Waiting(_)));
        assert_eq!(p.observe(secs(12), at(2)), Observation::Stable);
    }

    #[test]
    fn change_during_stabilizing_restarts_window() {
        let mut p = InstallProgress::new(&WatcherConfig::default(), at(0));
        for (t, m) in [(2, 1), (4, 2), (6, 2)] {
            let _ = p.observe(secs(t), at(m));
        }
        let _ = p.observe(secs(8), at(3));
        assert_eq!(p.stable_duration, Duration::ZERO);
        assert_eq!(p.update_count, 3);
    }

    #[test]
    fn phase_messages_are_readable() {
        let phase = WatchPhase::Stabilizing {
            stable: secs(2),
            threshold: secs(4),
        };
        assert_eq!(phase.to_string(), "verifying stability (2s/4s)");
    }

    #[test]
    fn unconfirmed_converts_to_timeout() {
        let key = ContainerKey::new("com.x").unwrap();
        let err = InstallOutcome::Unconfirmed { waited: secs(300) }
            .into_result(&key)
            .unwrap_err();
        assert!(err.is_soft());
        assert!(InstallOutcome::Completed.into_result(&key).is_ok());
    }
}

//! End-to-end integration tests for the AppVault runtime.
//!
//! These tests drive the full stack against a scripted command runner and
//! virtual time:
//! 1. Single-container teardown (graceful then forced termination)
//! 2. Mass unmount sessions (blocking, force offers, cancellation)
//! 3. Storage drive eject
//! 4. Launch preparation, internal data, auto-unmount on exit, and locks
//! 5. Installation watching (stability, host exit, timeout)
//! 6. Unknown application liveness

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use appvault_common::config::AppVaultConfig;
use appvault_common::error::{Result, UnmountFailureKind, VaultError};
use appvault_common::guard::CriticalOperations;
use appvault_common::types::{Container, ContainerKey, InternalDataStrategy};
use appvault_core::lock::LockCoordinator;
use appvault_core::process::{CommandRunner, CommandSpec};
use appvault_core::testing::{PlistEntry, Reply, ScriptedRunner, info_plist};
use appvault_core::volume::VolumeManager;
use appvault_runtime::autounmount::AutoUnmountTasks;
use appvault_runtime::clock::{Clock, ManualClock};
use appvault_runtime::confirm::{EjectFailure, FixedConfirmation, ForceConfirmation};
use appvault_runtime::escalator::{
    SafeUnmount, SessionOptions, Stage, TeardownOutcome, UnmountEscalator, UnmountReport,
};
use appvault_runtime::launch;
use appvault_runtime::lifecycle::{AppLifecycle, ProcessLifecycle, TerminationMode};
use appvault_runtime::watcher::{InstallOutcome, InstallationWatcher};
use async_trait::async_trait;

// ── Fixtures ─────────────────────────────────────────────────────────

const BUSY: &str = "Unmount of disk7 failed: at least one volume could not be unmounted\n\
                    Dissented by PID 4242 (/Applications/Game.app/Contents/MacOS/Game)";

/// Applications keyed by container; termination is recorded in the runner's
/// call log so its order relative to ejects can be asserted. While `blind`
/// is set, liveness cannot be determined.
struct FakeLifecycle {
    runner: Arc<ScriptedRunner>,
    running: Mutex<HashSet<String>>,
    quits_on_term: bool,
    blind: AtomicBool,
}

impl FakeLifecycle {
    fn new(runner: Arc<ScriptedRunner>, running: &[&str], quits_on_term: bool) -> Self {
        Self {
            runner,
            running: Mutex::new(running.iter().map(|s| (*s).to_string()).collect()),
            quits_on_term,
            blind: AtomicBool::new(false),
        }
    }

    fn set_blind(&self, blind: bool) {
        self.blind.store(blind, Ordering::SeqCst);
    }

    fn quit(&self, key: &str) {
        let _ = self.running.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl AppLifecycle for FakeLifecycle {
    async fn is_running(&self, key: &ContainerKey) -> Result<bool> {
        if self.blind.load(Ordering::SeqCst) {
            return Err(VaultError::CommandFailed {
                command: String::from("ps -axo pid=,command="),
                exit_code: 1,
                stderr: String::from("ps: sysctl: Operation not permitted"),
            });
        }
        Ok(self.running.lock().unwrap().contains(key.as_str()))
    }

    async fn terminate(&self, key: &ContainerKey, mode: TerminationMode) -> Result<usize> {
        let signal = match mode {
            TerminationMode::Graceful => "-TERM",
            TerminationMode::Forceful => "-KILL",
        };
        let _ = self
            .runner
            .output(&CommandSpec::new("kill").arg(signal).arg(key.as_str()))
            .await;
        if mode == TerminationMode::Forceful || self.quits_on_term {
            self.quit(key.as_str());
        }
        Ok(1)
    }

    async fn sync_preferences(&self, _key: &ContainerKey) {}
}

struct Harness {
    _dir: tempfile::TempDir,
    runner: Arc<ScriptedRunner>,
    clock: Arc<ManualClock>,
    lifecycle: Arc<FakeLifecycle>,
    escalator: Arc<UnmountEscalator>,
    config: AppVaultConfig,
}

impl Harness {
    fn new(running: &[&str], quits_on_term: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppVaultConfig {
            storage_root: dir.path().join("images"),
            containers_root: dir.path().join("containers"),
            temporary_mounts_dir: dir.path().join("tmp-mounts"),
            ..AppVaultConfig::default()
        };
        config.tools.diskutil = PathBuf::from("diskutil");
        config.tools.hdiutil = PathBuf::from("hdiutil");
        config.tools.ps = PathBuf::from("ps");
        config.tools.lsof = PathBuf::from("lsof");
        config.tools.defaults = PathBuf::from("defaults");
        config.watcher.settings_dir = dir.path().join("settings");
        config.watcher.applications_dir = dir.path().join("apps");
        std::fs::create_dir_all(&config.watcher.settings_dir).unwrap();
        std::fs::create_dir_all(&config.watcher.applications_dir).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let clock = Arc::new(ManualClock::new());
        let lifecycle = Arc::new(FakeLifecycle::new(runner.clone(), running, quits_on_term));
        let volumes = Arc::new(VolumeManager::new(runner.clone(), config.clone()));
        let escalator = Arc::new(UnmountEscalator::new(
            volumes,
            Arc::new(LockCoordinator::new()),
            lifecycle.clone(),
            clock.clone(),
            AutoUnmountTasks::new(),
        ));
        Self {
            _dir: dir,
            runner,
            clock,
            lifecycle,
            escalator,
            config,
        }
    }

    fn container(&self, key: &str) -> Container {
        self.config
            .layout()
            .container(&ContainerKey::new(key).unwrap())
    }

    /// Scripts `container` as mounted from `device` (a partition such as
    /// `disk7s1`).
    fn mounted(&self, container: &Container, device: &str) {
        let _ = self.runner.on(
            format!("info -plist {}", container.mount_point.display()),
            Reply::ok(info_plist(&[
                ("VolumeName", PlistEntry::Str(container.key.as_str())),
                ("DeviceIdentifier", PlistEntry::Str(device)),
            ])),
        );
    }

    /// Eject and kill calls, in order.
    fn escalation_calls(&self) -> Vec<String> {
        self.runner
            .calls()
            .into_iter()
            .filter(|c| c.contains(" eject ") || c.starts_with("kill "))
            .collect()
    }
}

fn key(s: &str) -> ContainerKey {
    ContainerKey::new(s).unwrap()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn install_bundle(applications_dir: &Path, name: &str, id: &str) -> PathBuf {
    let bundle = applications_dir.join(name);
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(
        bundle.join("Info.plist"),
        info_plist(&[("CFBundleIdentifier", PlistEntry::Str(id))]),
    )
    .unwrap();
    bundle
}

/// Declines every force offer and keeps what it was shown.
#[derive(Default)]
struct RecordingConfirmation {
    shown: Mutex<Vec<EjectFailure>>,
}

#[async_trait]
impl ForceConfirmation for RecordingConfirmation {
    async fn confirm_force_unmount(&self, failed: &[EjectFailure]) -> bool {
        self.shown.lock().unwrap().extend_from_slice(failed);
        false
    }

    async fn confirm_force_eject(&self, _drive: &str) -> bool {
        false
    }

    async fn confirm_force_terminate(&self, _key: &ContainerKey) -> bool {
        false
    }
}

// ── Single-container teardown ─────────────────────────────────────────

#[tokio::test]
async fn teardown_escalates_in_order() {
    let h = Harness::new(&["com.alpha"], false);
    let alpha = h.container("com.alpha");
    h.mounted(&alpha, "disk7s1");
    let _ = h
        .runner
        .on("eject disk7 -force", Reply::ok(""))
        .on("eject disk7", Reply::fail(BUSY));

    let outcome = h
        .escalator
        .teardown(&alpha, &FixedConfirmation(true))
        .await
        .unwrap();

    assert_eq!(outcome, TeardownOutcome::Forced);
    assert_eq!(
        h.escalation_calls(),
        vec![
            "diskutil eject disk7",
            "kill -TERM com.alpha",
            "diskutil eject disk7",
            "kill -KILL com.alpha",
            "diskutil eject disk7 -force",
        ]
    );
    assert_eq!(
        h.clock.sleeps(),
        vec![ms(500), ms(2_000), ms(500), ms(1_000), ms(500)]
    );
}

#[tokio::test]
async fn teardown_stops_after_graceful_quit() {
    let h = Harness::new(&["com.alpha"], true);
    let alpha = h.container("com.alpha");
    h.mounted(&alpha, "disk7s1");
    let _ = h
        .runner
        .once("eject disk7", Reply::fail(BUSY))
        .on("eject disk7", Reply::ok(""));

    let outcome = h
        .escalator
        .teardown(&alpha, &FixedConfirmation(false))
        .await
        .unwrap();

    assert_eq!(outcome, TeardownOutcome::AfterGracefulTermination);
    assert!(h.runner.calls_matching("-KILL").is_empty());
    assert!(h.runner.calls_matching("-force").is_empty());
}

#[tokio::test]
async fn declined_teardown_never_forces() {
    let h = Harness::new(&["com.alpha"], false);
    let alpha = h.container("com.alpha");
    h.mounted(&alpha, "disk7s1");
    let _ = h.runner.on("eject disk7", Reply::fail(BUSY));

    let err = h
        .escalator
        .teardown(&alpha, &FixedConfirmation(false))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        VaultError::UnmountFailed {
            kind: UnmountFailureKind::Busy,
            ..
        }
    ));
    assert!(h.runner.calls_matching("-force").is_empty());
    assert!(h.runner.calls_matching("-KILL").is_empty());
    assert!(h.lifecycle.is_running(&key("com.alpha")).await.unwrap());
}

// ── Mass unmount sessions ────────────────────────────────────────────

#[tokio::test]
async fn running_app_blocks_before_any_eject() {
    let h = Harness::new(&["com.beta"], false);
    let (alpha, beta) = (h.container("com.alpha"), h.container("com.beta"));
    h.mounted(&alpha, "disk7s1");
    h.mounted(&beta, "disk8s1");
    let _ = h.runner.on("eject", Reply::ok(""));

    let mut session = h
        .escalator
        .begin(vec![alpha, beta], SessionOptions::default());
    h.escalator.advance(&mut session).await;

    assert_eq!(
        session.stage(),
        &Stage::Blocked {
            running: vec![key("com.beta")]
        }
    );
    assert!(h.escalation_calls().is_empty());

    h.lifecycle.quit("com.beta");
    assert!(session.retry());
    h.escalator.advance(&mut session).await;
    assert_eq!(session.stage(), &Stage::NormalEject);
    h.escalator.advance(&mut session).await;
    assert_eq!(
        session.stage(),
        &Stage::Done(UnmountReport {
            unmounted: 2,
            failed: Vec::new(),
            ejected_drive: None,
        })
    );
}

#[tokio::test]
async fn busy_container_is_forced_after_confirmation() {
    let h = Harness::new(&[], false);
    let (alpha, beta) = (h.container("com.alpha"), h.container("com.beta"));
    h.mounted(&alpha, "disk7s1");
    h.mounted(&beta, "disk8s1");
    let _ = h
        .runner
        .on("eject disk7", Reply::ok(""))
        .on("eject disk8 -force", Reply::ok(""))
        .on("eject disk8", Reply::fail(BUSY));

    let session = h
        .escalator
        .run(
            vec![alpha, beta],
            SessionOptions::default(),
            &FixedConfirmation(true),
        )
        .await;

    assert_eq!(
        session.stage(),
        &Stage::Done(UnmountReport {
            unmounted: 2,
            failed: vec![key("com.beta")],
            ejected_drive: None,
        })
    );
    assert_eq!(
        h.escalation_calls(),
        vec![
            "diskutil eject disk7",
            "diskutil eject disk8",
            "diskutil eject disk8 -force",
        ]
    );
}

#[tokio::test]
async fn declining_force_cancels_with_containers_left_mounted() {
    let h = Harness::new(&[], false);
    let (alpha, beta) = (h.container("com.alpha"), h.container("com.beta"));
    h.mounted(&alpha, "disk7s1");
    h.mounted(&beta, "disk8s1");
    let _ = h
        .runner
        .on("eject disk7", Reply::ok(""))
        .on("eject disk8", Reply::fail(BUSY));

    let mut session = h
        .escalator
        .begin(vec![alpha, beta.clone()], SessionOptions::default());
    h.escalator.advance(&mut session).await;
    h.escalator.advance(&mut session).await;
    assert_eq!(
        session.stage(),
        &Stage::OfferForce {
            failed: vec![key("com.beta")]
        }
    );
    assert_eq!(session.succeeded_count(), 1);

    assert!(session.cancel());
    assert_eq!(session.stage(), &Stage::Cancelled);
    assert_eq!(session.pending_containers(), &[beta]);
    assert!(!session.confirm());
    assert!(h.runner.calls_matching("-force").is_empty());
}

#[tokio::test]
async fn force_offer_names_busy_volumes_and_holder() {
    let h = Harness::new(&[], false);
    let alpha = h.container("com.alpha");
    h.mounted(&alpha, "disk7s1");
    let _ = h
        .runner
        .on(
            "info -plist disk7",
            Reply::ok(info_plist(&[("VolumeName", PlistEntry::Str("com.alpha"))])),
        )
        .on(
            "list -plist disk7",
            Reply::ok(
                "<plist version='1.0'><dict><key>AllDisksAndPartitions</key><array>\
                 <dict><key>DeviceIdentifier</key><string>disk7</string>\
                 <key>Partitions</key><array>\
                 <dict><key>VolumeName</key><string>com.alpha</string></dict>\
                 <dict><key>VolumeName</key><string>Alpha Cache</string></dict>\
                 </array></dict></array></dict></plist>",
            ),
        )
        .on("eject disk7", Reply::fail(BUSY));
    let confirmation = RecordingConfirmation::default();

    let session = h
        .escalator
        .run(vec![alpha], SessionOptions::default(), &confirmation)
        .await;

    let expected = EjectFailure {
        key: key("com.alpha"),
        blocking_process: Some(String::from("Game")),
        volume_names: vec![String::from("com.alpha"), String::from("Alpha Cache")],
    };
    assert_eq!(session.stage(), &Stage::Cancelled);
    assert_eq!(session.failures(), std::slice::from_ref(&expected));
    assert_eq!(*confirmation.shown.lock().unwrap(), vec![expected]);
    assert!(h.runner.calls_matching("-force").is_empty());
}

#[tokio::test]
async fn busy_storage_drive_is_force_ejected_after_confirmation() {
    let h = Harness::new(&[], false);
    let _ = h
        .runner
        .on(
            format!("info -plist {}", h.config.storage_root.display()),
            Reply::ok(info_plist(&[
                ("VolumeName", PlistEntry::Str("Games")),
                ("DeviceIdentifier", PlistEntry::Str("disk9s1")),
                ("DeviceNode", PlistEntry::Str("/dev/disk9s1")),
                ("Internal", PlistEntry::Bool(false)),
            ])),
        )
        .on(
            "info -plist disk9",
            Reply::ok(info_plist(&[("MediaName", PlistEntry::Str("T7"))])),
        )
        .on("eject -force /dev/disk9s1", Reply::ok(""))
        .on("eject /dev/disk9s1", Reply::fail("Volume Games on disk9s1 is busy"));

    let options = SessionOptions {
        eject_storage_drive: true,
    };
    let mut session = h.escalator.begin(Vec::new(), options);
    while !session.stage().awaits_decision() && !session.stage().is_terminal() {
        h.escalator.advance(&mut session).await;
    }
    assert_eq!(
        session.stage(),
        &Stage::OfferForceEject {
            device: String::from("/dev/disk9s1"),
            display_name: String::from("T7"),
        }
    );

    assert!(session.confirm());
    h.escalator.advance(&mut session).await;
    assert_eq!(
        session.stage(),
        &Stage::Done(UnmountReport {
            unmounted: 0,
            failed: Vec::new(),
            ejected_drive: Some(String::from("T7")),
        })
    );
    assert_eq!(h.runner.calls_matching("eject -force /dev/disk9s1").len(), 1);
}

#[tokio::test]
async fn internal_storage_drive_is_left_alone() {
    let h = Harness::new(&[], false);
    let _ = h.runner.on(
        format!("info -plist {}", h.config.storage_root.display()),
        Reply::ok(info_plist(&[
            ("VolumeName", PlistEntry::Str("Macintosh HD")),
            ("Internal", PlistEntry::Bool(true)),
        ])),
    );
    let options = SessionOptions {
        eject_storage_drive: true,
    };

    let session = h
        .escalator
        .run(Vec::new(), options, &FixedConfirmation(true))
        .await;

    assert_eq!(session.stage(), &Stage::Done(UnmountReport::default()));
    assert!(h.escalation_calls().is_empty());
}

#[tokio::test]
async fn check_cancels_pending_auto_unmount_tasks() {
    let h = Harness::new(&[], false);
    h.escalator
        .tasks()
        .spawn(key("com.alpha"), std::future::pending());
    assert_eq!(h.escalator.tasks().active_keys().len(), 1);

    let session = h
        .escalator
        .run(Vec::new(), SessionOptions::default(), &FixedConfirmation(false))
        .await;

    assert!(session.stage().is_terminal());
    assert!(h.escalator.tasks().active_keys().is_empty());
}

// ── Launch and auto-unmount ──────────────────────────────────────────

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"img").unwrap();
}

#[tokio::test]
async fn prepare_launch_requires_an_image() {
    let h = Harness::new(&[], false);
    let alpha = h.container("com.alpha");

    let err = launch::prepare_launch(h.escalator.volumes(), h.escalator.locks(), &alpha, true, None)
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::MountFailed { .. }));
    assert!(h.runner.calls_matching("image attach").is_empty());
}

#[tokio::test]
async fn prepare_launch_mounts_once_and_locks() {
    let h = Harness::new(&[], false);
    let alpha = h.container("com.alpha");
    touch(&alpha.image_path);
    let info = format!("info -plist {}", alpha.mount_point.display());
    // Unmounted for the internal-data check and for the mount itself.
    let _ = h
        .runner
        .once(info.clone(), Reply::fail("Could not find disk"))
        .once(info, Reply::fail("Could not find disk"))
        .on("image attach", Reply::ok(""));
    h.mounted(&alpha, "disk7s1");

    let volumes = h.escalator.volumes();
    let locks = h.escalator.locks();
    assert!(launch::prepare_launch(volumes, locks, &alpha, true, None).await.unwrap());
    assert!(launch::prepare_launch(volumes, locks, &alpha, true, None).await.unwrap());

    let attaches = h.runner.calls_matching("image attach");
    assert_eq!(attaches.len(), 1);
    assert!(attaches[0].ends_with("--nobrowse"));
    assert!(locks.is_held(&alpha.key));
}

#[tokio::test]
async fn populated_mount_point_is_refused_then_merged() {
    let h = Harness::new(&[], false);
    let alpha = h.container("com.alpha");
    touch(&alpha.image_path);
    let save = alpha.mount_point.join("Data/Documents/save.dat");
    touch(&save);
    let _ = h
        .runner
        .on("image attach", Reply::ok(""))
        .on("unmount force", Reply::ok(""));
    let volumes = h.escalator.volumes();
    let locks = h.escalator.locks();

    let err = launch::prepare_launch(volumes, locks, &alpha, true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InternalDataPresent { entries: 1, .. }));
    assert!(h.runner.calls_matching("image attach").is_empty());
    assert!(save.exists());
    assert!(!locks.is_held(&alpha.key));

    let merge = Some(InternalDataStrategy::MergeThenDelete);
    assert!(launch::prepare_launch(volumes, locks, &alpha, true, merge).await.unwrap());

    let temp_mount = h.config.temporary_mounts_dir.join("com.alpha");
    assert!(temp_mount.join("Data/Documents/save.dat").exists());
    assert!(!alpha.mount_point.join("Data").exists());
    let attaches = h.runner.calls_matching("image attach");
    assert_eq!(attaches.len(), 2);
    assert!(attaches[0].contains(&format!("--mountPoint {}", temp_mount.display())));
    assert!(attaches[1].contains(&format!("--mountPoint {}", alpha.mount_point.display())));
    assert_eq!(
        h.runner.calls_matching("unmount force"),
        vec![format!("diskutil unmount force {}", temp_mount.display())]
    );
    assert!(locks.is_held(&alpha.key));
}

#[test]
fn lock_is_refused_before_the_mount_point_exists() {
    let h = Harness::new(&[], false);
    let alpha = h.container("com.alpha");

    assert!(!h.escalator.locks().lock(&alpha));
    assert!(!alpha.mount_point.exists());
}

#[tokio::test]
async fn safe_unmount_respects_foreign_lock() {
    let h = Harness::new(&[], false);
    let alpha = h.container("com.alpha");
    std::fs::create_dir_all(&alpha.mount_point).unwrap();
    h.mounted(&alpha, "disk7s1");
    let _ = h.runner.on("eject disk7", Reply::ok(""));

    let other_instance = LockCoordinator::new();
    assert!(other_instance.lock(&alpha));
    assert_eq!(
        h.escalator.unmount_safely(&alpha).await.unwrap(),
        SafeUnmount::HeldElsewhere
    );
    assert!(h.escalation_calls().is_empty());

    other_instance.unlock(&alpha);
    assert_eq!(
        h.escalator.unmount_safely(&alpha).await.unwrap(),
        SafeUnmount::Unmounted
    );
    assert_eq!(h.escalation_calls(), vec!["diskutil eject disk7"]);
}

#[tokio::test]
async fn app_exit_triggers_auto_unmount() {
    let h = Harness::new(&["com.alpha"], false);
    let alpha = h.container("com.alpha");
    h.mounted(&alpha, "disk7s1");
    let _ = h.runner.on("eject disk7", Reply::ok(""));

    launch::watch_exit_and_unmount(&h.escalator, alpha.clone(), ms(2_000));
    tokio::task::yield_now().await;
    assert!(h.escalation_calls().is_empty());

    h.lifecycle.quit("com.alpha");
    for _ in 0..500 {
        if h.escalator.tasks().active_keys().is_empty() {
            break;
        }
        tokio::time::sleep(ms(10)).await;
    }
    assert!(h.escalator.tasks().active_keys().is_empty());
    assert_eq!(h.escalation_calls(), vec!["diskutil eject disk7"]);
}

#[tokio::test]
async fn unknown_liveness_keeps_auto_unmount_waiting() {
    let h = Harness::new(&["com.alpha"], false);
    let alpha = h.container("com.alpha");
    h.mounted(&alpha, "disk7s1");
    let _ = h.runner.on("eject disk7", Reply::ok(""));

    launch::watch_exit_and_unmount(&h.escalator, alpha.clone(), ms(2_000));
    tokio::task::yield_now().await;
    h.lifecycle.set_blind(true);
    h.lifecycle.quit("com.alpha");
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(h.escalation_calls().is_empty());
    assert_eq!(h.escalator.tasks().active_keys(), vec![key("com.alpha")]);

    h.lifecycle.set_blind(false);
    for _ in 0..500 {
        if h.escalator.tasks().active_keys().is_empty() {
            break;
        }
        tokio::time::sleep(ms(10)).await;
    }
    assert_eq!(h.escalation_calls(), vec!["diskutil eject disk7"]);
}

#[tokio::test]
async fn stale_sentinels_are_cleaned_up() {
    let h = Harness::new(&[], false);
    let (alpha, beta) = (h.container("com.alpha"), h.container("com.beta"));
    std::fs::create_dir_all(&alpha.mount_point).unwrap();
    std::fs::create_dir_all(&beta.mount_point).unwrap();
    let crashed = LockCoordinator::new();
    assert!(crashed.lock(&alpha));
    drop(crashed);
    assert!(h.escalator.locks().lock(&beta));

    let removed = h.escalator.locks().cleanup_stale([&alpha, &beta]);

    assert_eq!(removed, 1);
    assert!(!appvault_core::lock::sentinel_path(&alpha).exists());
    assert!(appvault_core::lock::sentinel_path(&beta).exists());
}

// ── Installation watching ────────────────────────────────────────────

/// Virtual clock that rewrites the settings file's modification time when
/// virtual time passes scheduled points, standing in for the host writing
/// it.
struct ScriptedWrites {
    inner: ManualClock,
    file: PathBuf,
    writes: Mutex<Vec<(Duration, SystemTime)>>,
}

#[async_trait]
impl Clock for ScriptedWrites {
    fn now(&self) -> Duration {
        self.inner.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration).await;
        let now = self.inner.now();
        let mut writes = self.writes.lock().unwrap();
        while writes.first().is_some_and(|(at, _)| *at <= now) {
            let (_, mtime) = writes.remove(0);
            File::options()
                .write(true)
                .open(&self.file)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
    }
}

fn host_running(runner: &ScriptedRunner) {
    let _ = runner.on(
        "ps -axo",
        Reply::ok("  1 /sbin/launchd\n 10 /Applications/PlayCover.app/Contents/MacOS/PlayCover\n"),
    );
}

fn watcher(h: &Harness, clock: Arc<dyn Clock>, critical: &CriticalOperations) -> InstallationWatcher {
    InstallationWatcher::new(
        h.runner.clone(),
        clock,
        h.config.tools.clone(),
        h.config.watcher.clone(),
        critical.clone(),
    )
}

#[tokio::test]
async fn install_completes_after_two_updates_and_stability() {
    let h = Harness::new(&[], false);
    let game = key("com.example.game");
    let settings = h.config.watcher.settings_file(&game);
    std::fs::write(&settings, b"<plist/>").unwrap();
    let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    File::options()
        .write(true)
        .open(&settings)
        .unwrap()
        .set_modified(base)
        .unwrap();
    host_running(&h.runner);
    let _ = h.runner.on("lsof ", Reply::fail(""));

    let clock = Arc::new(ScriptedWrites {
        inner: ManualClock::new(),
        file: settings,
        writes: Mutex::new(vec![
            (Duration::from_secs(5), base + Duration::from_secs(5)),
            (Duration::from_secs(10), base + Duration::from_secs(10)),
        ]),
    });
    let critical = CriticalOperations::new();
    let mut statuses = Vec::new();

    let outcome = watcher(&h, clock.clone(), &critical)
        .watch(&game, |s| statuses.push(s.to_string()))
        .await
        .unwrap();

    assert_eq!(outcome, InstallOutcome::Completed);
    assert_eq!(clock.now(), Duration::from_secs(14));
    assert_eq!(statuses.last().map(String::as_str), Some("installed"));
    assert_eq!(h.runner.calls_matching("lsof ").len(), 1);
    assert!(!critical.is_active());
}

#[tokio::test]
async fn host_exit_with_marker_counts_as_installed() {
    let h = Harness::new(&[], false);
    let game = key("com.example.game");
    let bundle = h.config.watcher.applications_dir.join("Game.app");
    std::fs::create_dir_all(bundle.join("_CodeSignature")).unwrap();
    std::fs::write(
        bundle.join("Info.plist"),
        info_plist(&[("CFBundleIdentifier", PlistEntry::Str("com.example.game"))]),
    )
    .unwrap();
    let _ = h.runner.on("ps -axo", Reply::ok(""));

    let outcome = watcher(&h, h.clock.clone(), &CriticalOperations::new())
        .watch(&game, |_| {})
        .await
        .unwrap();

    assert_eq!(outcome, InstallOutcome::CompletedAfterHostExit);
}

#[tokio::test]
async fn host_exit_without_marker_is_a_crash() {
    let h = Harness::new(&[], false);
    let game = key("com.example.game");
    let _ = h.runner.on("ps -axo", Reply::ok(""));
    let critical = CriticalOperations::new();

    let err = watcher(&h, h.clock.clone(), &critical)
        .watch(&game, |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::CrashedDuringOperation { .. }));
    assert!(!critical.is_active());
}

#[tokio::test]
async fn silent_install_times_out_unconfirmed() {
    let mut h = Harness::new(&[], false);
    h.config.watcher.max_wait_ms = 10_000;
    let game = key("com.example.game");
    host_running(&h.runner);

    let outcome = watcher(&h, h.clock.clone(), &CriticalOperations::new())
        .watch(&game, |_| {})
        .await
        .unwrap();

    assert_eq!(
        outcome,
        InstallOutcome::Unconfirmed {
            waited: Duration::from_secs(10)
        }
    );
    assert!(outcome.into_result(&game).unwrap_err().is_soft());
}

// ── Unknown application liveness ────────────────────────────────────

#[tokio::test]
async fn unreadable_process_table_never_leads_to_an_eject() {
    let h = Harness::new(&[], false);
    let alpha = h.container("com.alpha");
    let _ = install_bundle(&h.config.watcher.applications_dir, "Alpha.app", "com.alpha");
    h.mounted(&alpha, "disk7s1");
    let _ = h
        .runner
        .on("ps -axo", Reply::fail("ps: sysctl: Operation not permitted"))
        .on("eject disk7", Reply::fail(BUSY));
    let lifecycle = Arc::new(ProcessLifecycle::new(
        h.runner.clone(),
        h.config.tools.clone(),
        h.config.watcher.applications_dir.clone(),
    ));
    let escalator = UnmountEscalator::new(
        Arc::clone(h.escalator.volumes()),
        Arc::new(LockCoordinator::new()),
        lifecycle,
        h.clock.clone(),
        AutoUnmountTasks::new(),
    );

    let session = escalator
        .run(vec![alpha.clone()], SessionOptions::default(), &FixedConfirmation(true))
        .await;
    assert!(matches!(
        session.stage(),
        Stage::Failed { message } if message.contains("com.alpha")
    ));
    assert!(h.escalation_calls().is_empty());

    let err = escalator
        .teardown(&alpha, &FixedConfirmation(true))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::CommandFailed { .. }));
    assert_eq!(h.escalation_calls(), vec!["diskutil eject disk7"]);
}

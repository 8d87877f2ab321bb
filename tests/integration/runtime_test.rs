//! Integration tests for volume and unmount orchestration.
//!
//! These tests are implemented in:
//! `crates/appvault-runtime/tests/e2e_test.rs`
//!
//! Covered scenarios:
//! - `teardown_escalates_in_order`: unforced eject, SIGTERM, retry, SIGKILL, forced eject
//! - `declined_teardown_never_forces`: no forced step without confirmation
//! - `running_app_blocks_before_any_eject`: Blocked stage touches nothing
//! - `busy_container_is_forced_after_confirmation`: OfferForce then ForceEject
//! - `declining_force_cancels_with_containers_left_mounted`: cancellation keeps pending containers
//! - `busy_storage_drive_is_force_ejected_after_confirmation`: drive eject escalation
//! - `prepare_launch_mounts_once_and_locks`: idempotent mount plus lock
//! - `safe_unmount_respects_foreign_lock`: HeldElsewhere while another holder exists
//! - `app_exit_triggers_auto_unmount`: background unmount after the application quits
//! - `install_completes_after_two_updates_and_stability`: watcher completes at 14s
//! - `host_exit_without_marker_is_a_crash`: crash detection
//! - `silent_install_times_out_unconfirmed`: soft timeout

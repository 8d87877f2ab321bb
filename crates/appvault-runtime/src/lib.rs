//! # appvault-runtime
//!
//! Orchestration on top of the core primitives: the multi-stage unmount
//! escalation, the installation completion watcher, launch preparation, and
//! the registry of background auto-unmount tasks.
//!
//! Time and process control are injected through the [`clock::Clock`] and
//! [`lifecycle::AppLifecycle`] traits so every state machine here can be
//! driven deterministically.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod autounmount;
pub mod bundle;
pub mod clock;
pub mod confirm;
pub mod escalator;
pub mod internal_data;
pub mod launch;
pub mod lifecycle;
pub mod watcher;

//! # appvault-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire AppVault workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the foundational primitives that all other
//! crates build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod guard;
pub mod types;

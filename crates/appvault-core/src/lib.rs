//! # appvault-core
//!
//! OS-facing primitives for AppVault containers.
//!
//! - **Process execution**: asynchronous invocation of the external volume,
//!   process, and preference utilities
//! - **Property lists**: parsing of the XML plists those utilities emit
//! - **Volumes**: disk-image creation, attach, detach, eject, and queries
//! - **Locks**: per-container advisory locks on a sentinel file

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod lock;
pub mod plist;
pub mod process;
pub mod testing;
pub mod volume;

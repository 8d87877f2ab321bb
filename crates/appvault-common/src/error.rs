//! Unified error types for the AppVault workspace.
//!
//! Lock contention is deliberately absent: lock operations report it as a
//! `false` outcome rather than an error.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why an unmount or eject was refused by the volume utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountFailureKind {
    /// The volume is held open by some process ("resource busy").
    Busy,
    /// Any other failure reported by the utility.
    Other,
}

impl std::fmt::Display for UnmountFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => write!(f, "resource busy"),
            Self::Other => write!(f, "failed"),
        }
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum VaultError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An external utility could not be started at all.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An external utility exited with a non-zero status.
    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    CommandFailed {
        /// Full command line, program first.
        command: String,
        /// Exit status (`-1` when terminated by a signal).
        exit_code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// The disk image for a container could not be created.
    #[error("disk image creation failed for {key}: {stderr}")]
    ImageCreationFailed {
        /// Container key.
        key: String,
        /// Utility diagnostics.
        stderr: String,
    },

    /// The disk image for a container could not be attached.
    #[error("mount failed for {key}: {stderr}")]
    MountFailed {
        /// Container key.
        key: String,
        /// Utility diagnostics.
        stderr: String,
    },

    /// A volume or device could not be unmounted or ejected.
    #[error("unmount of {target} {kind}: {stderr}")]
    UnmountFailed {
        /// Mount point or device that was targeted.
        target: String,
        /// Busy versus any other cause.
        kind: UnmountFailureKind,
        /// Name of the process holding the volume, when the utility reports it.
        blocking_process: Option<String>,
        /// Volumes on the disk the utility could not unmount, when known.
        volume_names: Vec<String>,
        /// Utility diagnostics.
        stderr: String,
    },

    /// An unmounted container's mount point holds files that mounting would
    /// hide, and no strategy for them was chosen.
    #[error("{key} has {entries} item(s) at {} that mounting would hide", path.display())]
    InternalDataPresent {
        /// Container key.
        key: String,
        /// Mount point holding the files.
        path: PathBuf,
        /// Number of top-level entries found.
        entries: usize,
    },

    /// No device node could be found for a path.
    #[error("could not resolve a device for {path}")]
    DeviceResolutionFailed {
        /// Path whose backing device was requested.
        path: PathBuf,
    },

    /// The external installer exited before completion could be confirmed.
    #[error("installer exited before {key} was installed")]
    CrashedDuringOperation {
        /// Identifier of the application being installed.
        key: String,
    },

    /// The installation could be neither confirmed nor refuted in time.
    #[error("installation of {key} not confirmed after {}s", waited.as_secs())]
    TimeoutUndetected {
        /// Identifier of the application being installed.
        key: String,
        /// How long the watcher waited.
        waited: Duration,
    },

    /// A property list could not be parsed.
    #[error("malformed property list: {message}")]
    Plist {
        /// Parser diagnostics.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl VaultError {
    /// Returns `true` for failures the caller may treat as "unconfirmed"
    /// rather than destructive.
    #[must_use]
    pub const fn is_soft(&self) -> bool {
        matches!(self, Self::TimeoutUndetected { .. })
    }

    /// Returns `true` when the utility refused an unmount because the
    /// volume was busy.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::UnmountFailed {
                kind: UnmountFailureKind::Busy,
                ..
            }
        )
    }

    /// Captured standard error of a failed utility invocation, if any.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. }
            | Self::ImageCreationFailed { stderr, .. }
            | Self::MountFailed { stderr, .. }
            | Self::UnmountFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VaultError>;

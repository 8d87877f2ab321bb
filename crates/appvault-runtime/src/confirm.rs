//! Confirmation of destructive escalations.
//!
//! Nothing in this crate forces an unmount, ejects a busy drive, or kills
//! a process without a `true` from one of these callbacks.

use std::fmt;

use appvault_common::error::VaultError;
use appvault_common::types::ContainerKey;
use async_trait::async_trait;

/// A container whose unforced eject was refused, with whatever the volume
/// utility said about why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjectFailure {
    /// Container that stayed mounted.
    pub key: ContainerKey,
    /// Process reported as holding the disk.
    pub blocking_process: Option<String>,
    /// Volumes on the disk that could not be unmounted.
    pub volume_names: Vec<String>,
}

impl EjectFailure {
    /// Collects the details carried by `error` for `key`.
    #[must_use]
    pub fn new(key: ContainerKey, error: &VaultError) -> Self {
        let (blocking_process, volume_names) = match error {
            VaultError::UnmountFailed {
                blocking_process,
                volume_names,
                ..
            } => (blocking_process.clone(), volume_names.clone()),
            _ => (None, Vec::new()),
        };
        Self {
            key,
            blocking_process,
            volume_names,
        }
    }
}

impl fmt::Display for EjectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        match (self.volume_names.is_empty(), &self.blocking_process) {
            (true, None) => Ok(()),
            (true, Some(process)) => write!(f, " (in use by {process})"),
            (false, None) => write!(f, " (busy volumes: {})", self.volume_names.join(", ")),
            (false, Some(process)) => write!(
                f,
                " (busy volumes: {}; in use by {process})",
                self.volume_names.join(", ")
            ),
        }
    }
}

/// User-confirmation callback for force escalations.
#[async_trait]
pub trait ForceConfirmation: Send + Sync {
    /// Force-unmount containers whose normal eject failed?
    async fn confirm_force_unmount(&self, failed: &[EjectFailure]) -> bool;

    /// Force-eject the storage drive `drive`?
    async fn confirm_force_eject(&self, drive: &str) -> bool;

    /// Kill the application owning `key` and force its volume off?
    async fn confirm_force_terminate(&self, key: &ContainerKey) -> bool;
}

/// Answers every prompt with a fixed decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedConfirmation(pub bool);

#[async_trait]
impl ForceConfirmation for FixedConfirmation {
    async fn confirm_force_unmount(&self, _failed: &[EjectFailure]) -> bool {
        self.0
    }

    async fn confirm_force_eject(&self, _drive: &str) -> bool {
        self.0
    }

    async fn confirm_force_terminate(&self, _key: &ContainerKey) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appvault_common::error::UnmountFailureKind;

    fn busy(process: Option<&str>, volumes: &[&str]) -> VaultError {
        VaultError::UnmountFailed {
            target: "disk5".into(),
            kind: UnmountFailureKind::Busy,
            blocking_process: process.map(String::from),
            volume_names: volumes.iter().map(|v| (*v).to_string()).collect(),
            stderr: String::new(),
        }
    }

    #[test]
    fn display_names_volumes_and_holder() {
        let key = ContainerKey::new("com.example.game").unwrap();
        let full = EjectFailure::new(key.clone(), &busy(Some("Game"), &["com.example.game", "Data"]));
        assert_eq!(
            full.to_string(),
            "com.example.game (busy volumes: com.example.game, Data; in use by Game)"
        );
        let process_only = EjectFailure::new(key.clone(), &busy(Some("Game"), &[]));
        assert_eq!(process_only.to_string(), "com.example.game (in use by Game)");
        let other = EjectFailure::new(
            key,
            &VaultError::DeviceResolutionFailed {
                path: "/x".into(),
            },
        );
        assert_eq!(other.to_string(), "com.example.game");
        assert!(other.volume_names.is_empty());
    }
}

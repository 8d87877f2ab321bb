//! Domain primitive types used across the AppVault workspace.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Stable identifier of a container: the bundle identifier of the
/// application whose data it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerKey(String);

impl ContainerKey {
    /// Creates a key after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] if the key is empty, contains a path
    /// separator, or starts with a dot.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(VaultError::Config {
                message: "container key must not be empty".into(),
            });
        }
        if key.contains('/') || key.contains('\\') {
            return Err(VaultError::Config {
                message: format!("container key must not contain path separators: {key}"),
            });
        }
        if key.starts_with('.') {
            return Err(VaultError::Config {
                message: format!("container key must not start with a dot: {key}"),
            });
        }
        Ok(Self(key))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContainerKey {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContainerKey> for String {
    fn from(key: ContainerKey) -> Self {
        key.0
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-application storage root backed by a mountable disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Bundle identifier of the owning application.
    pub key: ContainerKey,
    /// Directory the image's volume is attached at.
    pub mount_point: PathBuf,
    /// Disk-image file backing the volume.
    pub image_path: PathBuf,
}

impl Container {
    /// Volume name given to the image at creation time.
    #[must_use]
    pub fn volume_name(&self) -> &str {
        self.key.as_str()
    }
}

/// Derives container paths from the configured roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLayout {
    /// Directory holding the disk images.
    pub storage_root: PathBuf,
    /// Directory holding one mount point per container.
    pub containers_root: PathBuf,
    /// File extension of the disk images, without the dot.
    pub image_extension: String,
}

impl ContainerLayout {
    /// Builds the container for a key.
    #[must_use]
    pub fn container(&self, key: &ContainerKey) -> Container {
        Container {
            key: key.clone(),
            mount_point: self.containers_root.join(key.as_str()),
            image_path: self
                .storage_root
                .join(format!("{}.{}", key.as_str(), self.image_extension)),
        }
    }

    /// Parses and validates a key, then builds its container.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid.
    pub fn resolve(&self, key: &str) -> Result<Container> {
        Ok(self.container(&ContainerKey::new(key)?))
    }

    /// Lists the containers that currently have an image in the storage root.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be read. A missing
    /// storage root yields an empty list.
    pub fn discover(&self) -> Result<Vec<Container>> {
        if !self.storage_root.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.storage_root).map_err(|e| VaultError::Io {
            path: self.storage_root.clone(),
            source: e,
        })?;
        let mut containers = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.image_extension.as_str()) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(key) = ContainerKey::new(stem) {
                containers.push(self.container(&key));
            }
        }
        containers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(containers)
    }
}

/// Mount status of a container, computed fresh for every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountState {
    /// Whether the disk-image file exists.
    pub exists: bool,
    /// Whether the container's volume is attached at its mount point.
    pub mounted: bool,
    /// Mount point when mounted.
    pub volume_path: Option<PathBuf>,
    /// Size of the image file in bytes, when it exists.
    pub size_on_disk: Option<u64>,
}

/// Descriptive metadata for the volume backing a path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Name of the mounted volume.
    pub volume_name: Option<String>,
    /// Device node, e.g. `/dev/disk4s1`.
    pub device_path: Option<String>,
    /// Device identifier, e.g. `disk4s1`.
    pub device_identifier: Option<String>,
    /// Media name reported by the drive, e.g. `Samsung T7`.
    pub media_name: Option<String>,
}

impl VolumeInfo {
    /// Human-readable name: media name, then device, then volume name.
    #[must_use]
    pub fn display_name(&self) -> String {
        [&self.media_name, &self.device_identifier, &self.volume_name]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| String::from("Unknown"))
    }
}

/// Returns the whole-disk identifier for a partition (`disk5s2` becomes
/// `disk5`). Identifiers without a slice suffix are returned unchanged.
#[must_use]
pub fn parent_disk(identifier: &str) -> &str {
    let trimmed = identifier.trim_start_matches("/dev/");
    let Some(pos) = trimmed.rfind('s') else {
        return trimmed;
    };
    let (head, tail) = trimmed.split_at(pos);
    let digits = &tail[1..];
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) && head.starts_with("disk")
    {
        head
    } else {
        trimmed
    }
}

/// What to do with files found in an unmounted container's mount point
/// before attaching the image over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InternalDataStrategy {
    /// Delete the files, then mount.
    Discard,
    /// Copy the files into the image, delete them, then mount.
    MergeThenDelete,
    /// Mount over the files, hiding them until the next unmount.
    Leave,
}

impl InternalDataStrategy {
    /// Every strategy, in menu order.
    pub const ALL: [Self; 3] = [Self::MergeThenDelete, Self::Discard, Self::Leave];

    /// Name used in configuration and on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::MergeThenDelete => "merge-then-delete",
            Self::Leave => "leave",
        }
    }

    /// One-line explanation for menus.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Discard => "delete the existing files, then mount",
            Self::MergeThenDelete => "copy the existing files into the image, delete them, then mount",
            Self::Leave => "mount over the existing files without touching them",
        }
    }
}

impl fmt::Display for InternalDataStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InternalDataStrategy {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| VaultError::Config {
                message: format!(
                    "unknown internal data strategy {s:?} (expected discard, merge-then-delete, or leave)"
                ),
            })
    }
}

/// Yields `path` and each of its ancestors, nearest first.
pub fn walk_up(path: &Path) -> impl Iterator<Item = &Path> {
    path.ancestors().filter(|p| !p.as_os_str().is_empty())
}

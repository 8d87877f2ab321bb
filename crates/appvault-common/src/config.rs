//! Global configuration model for AppVault.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, VaultError};
use crate::types::{ContainerKey, ContainerLayout, InternalDataStrategy};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppVaultConfig {
    /// Directory holding the disk images.
    pub storage_root: PathBuf,
    /// Directory holding one mount point per container.
    pub containers_root: PathBuf,
    /// Disk-image file extension, without the dot.
    pub image_extension: String,
    /// Disk-image format passed to the creation utility.
    pub image_format: String,
    /// Image size for ordinary containers, in utility notation (`50G`).
    pub default_image_size: String,
    /// Bundle identifier of the side-loading host.
    pub host_key: String,
    /// Image size for the host's own container.
    pub host_image_size: String,
    /// Hide mounted volumes from the desktop.
    pub nobrowse: bool,
    /// Strategy for files found in an unmounted mount point. `None` asks
    /// every time.
    pub internal_data: Option<InternalDataStrategy>,
    /// Base directory for temporary mounts used while merging data.
    pub temporary_mounts_dir: PathBuf,
    /// Locations of the external utilities.
    pub tools: ToolPaths,
    /// Installation watcher thresholds.
    pub watcher: WatcherConfig,
    /// Unmount escalation delays.
    pub escalation: EscalationConfig,
}

impl Default for AppVaultConfig {
    fn default() -> Self {
        Self {
            storage_root: constants::default_storage_root(),
            containers_root: constants::default_containers_root(),
            image_extension: constants::DEFAULT_IMAGE_EXTENSION.into(),
            image_format: constants::DEFAULT_IMAGE_FORMAT.into(),
            default_image_size: constants::DEFAULT_IMAGE_SIZE.into(),
            host_key: constants::DEFAULT_HOST_KEY.into(),
            host_image_size: constants::DEFAULT_HOST_IMAGE_SIZE.into(),
            nobrowse: true,
            internal_data: None,
            temporary_mounts_dir: constants::default_temporary_mounts_dir(),
            tools: ToolPaths::default(),
            watcher: WatcherConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }
}

impl AppVaultConfig {
    /// Loads the configuration from a JSON file. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| VaultError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Checks values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.image_extension.is_empty() || self.image_extension.contains('.') {
            return Err(VaultError::Config {
                message: format!("invalid image extension: {:?}", self.image_extension),
            });
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err(VaultError::Config {
                message: "watcher.poll_interval_ms must be positive".into(),
            });
        }
        if self.watcher.max_wait_ms < self.watcher.poll_interval_ms {
            return Err(VaultError::Config {
                message: "watcher.max_wait_ms must be at least one poll interval".into(),
            });
        }
        Ok(())
    }

    /// Path layout derived from the storage settings.
    #[must_use]
    pub fn layout(&self) -> ContainerLayout {
        ContainerLayout {
            storage_root: self.storage_root.clone(),
            containers_root: self.containers_root.clone(),
            image_extension: self.image_extension.clone(),
        }
    }

    /// Image size used when creating the image for `key`.
    #[must_use]
    pub fn image_size_for(&self, key: &ContainerKey) -> &str {
        if key.as_str() == self.host_key {
            &self.host_image_size
        } else {
            &self.default_image_size
        }
    }
}

fn locate(name: &str, fallback: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(fallback))
}

/// Absolute paths of the external utilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Volume-management utility.
    pub diskutil: PathBuf,
    /// Disk-image utility, used for resizing.
    pub hdiutil: PathBuf,
    /// Process listing.
    pub ps: PathBuf,
    /// Open-file listing.
    pub lsof: PathBuf,
    /// Preferences utility.
    pub defaults: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            diskutil: locate("diskutil", constants::DISKUTIL_PATH),
            hdiutil: locate("hdiutil", constants::HDIUTIL_PATH),
            ps: locate("ps", constants::PS_PATH),
            lsof: locate("lsof", constants::LSOF_PATH),
            defaults: locate("defaults", constants::DEFAULTS_PATH),
        }
    }
}

/// Thresholds of the installation watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Interval between samples.
    pub poll_interval_ms: u64,
    /// How long the settings artifact must stay unchanged.
    pub stability_threshold_ms: u64,
    /// Delay after a lone update before the stability check applies anyway.
    pub single_update_fallback_ms: u64,
    /// Give up after this long.
    pub max_wait_ms: u64,
    /// Name that identifies the host process in the process listing.
    pub host_process_name: String,
    /// Directory holding `<key>.plist` settings artifacts.
    pub settings_dir: PathBuf,
    /// Directory the host installs `*.app` bundles into.
    pub applications_dir: PathBuf,
    /// Entry that exists inside a bundle once installation finished.
    pub completion_marker: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            stability_threshold_ms: 4_000,
            single_update_fallback_ms: 8_000,
            max_wait_ms: 300_000,
            host_process_name: constants::DEFAULT_HOST_PROCESS_NAME.into(),
            settings_dir: constants::default_settings_dir(),
            applications_dir: constants::default_applications_dir(),
            completion_marker: constants::DEFAULT_COMPLETION_MARKER.into(),
        }
    }
}

impl WatcherConfig {
    /// See [`Self::poll_interval_ms`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// See [`Self::stability_threshold_ms`].
    #[must_use]
    pub const fn stability_threshold(&self) -> Duration {
        Duration::from_millis(self.stability_threshold_ms)
    }

    /// See [`Self::single_update_fallback_ms`].
    #[must_use]
    pub const fn single_update_fallback(&self) -> Duration {
        Duration::from_millis(self.single_update_fallback_ms)
    }

    /// See [`Self::max_wait_ms`].
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Settings artifact watched for `key`.
    #[must_use]
    pub fn settings_file(&self, key: &ContainerKey) -> PathBuf {
        self.settings_dir.join(format!("{key}.plist"))
    }
}

/// Delays used by the unmount escalator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Wait after syncing before each eject attempt.
    pub settle_delay_ms: u64,
    /// Wait after a graceful termination signal.
    pub graceful_grace_ms: u64,
    /// Wait after a forceful termination signal.
    pub forceful_grace_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            graceful_grace_ms: 2_000,
            forceful_grace_ms: 1_000,
        }
    }
}

impl EscalationConfig {
    /// See [`Self::settle_delay_ms`].
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// See [`Self::graceful_grace_ms`].
    #[must_use]
    pub const fn graceful_grace(&self) -> Duration {
        Duration::from_millis(self.graceful_grace_ms)
    }

    /// See [`Self::forceful_grace_ms`].
    #[must_use]
    pub const fn forceful_grace(&self) -> Duration {
        Duration::from_millis(self.forceful_grace_ms)
    }
}

//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "appvault";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "avlt";

/// Hidden zero-byte file placed inside each mount point to carry the
/// advisory lock.
pub const LOCK_FILE_NAME: &str = ".appvault_lock";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Bundle identifier of the side-loading host application.
pub const DEFAULT_HOST_KEY: &str = "io.playcover.PlayCover";

/// Process name that identifies a running host application.
pub const DEFAULT_HOST_PROCESS_NAME: &str = "PlayCover";

/// Image size for ordinary application containers.
pub const DEFAULT_IMAGE_SIZE: &str = "50G";

/// Image size for the host application's own container.
pub const DEFAULT_HOST_IMAGE_SIZE: &str = "10T";

/// Disk-image file extension, without the dot.
pub const DEFAULT_IMAGE_EXTENSION: &str = "asif";

/// Disk-image format passed to the creation utility.
pub const DEFAULT_IMAGE_FORMAT: &str = "ASIF";

/// Entry inside an installed bundle that only exists once signing finished.
pub const DEFAULT_COMPLETION_MARKER: &str = "_CodeSignature";

/// Fallback locations of the external utilities on macOS.
pub const DISKUTIL_PATH: &str = "/usr/sbin/diskutil";
/// See [`DISKUTIL_PATH`].
pub const HDIUTIL_PATH: &str = "/usr/bin/hdiutil";
/// See [`DISKUTIL_PATH`].
pub const PS_PATH: &str = "/bin/ps";
/// See [`DISKUTIL_PATH`].
pub const LSOF_PATH: &str = "/usr/sbin/lsof";
/// See [`DISKUTIL_PATH`].
pub const DEFAULTS_PATH: &str = "/usr/bin/defaults";

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Returns the data directory, preferring `$HOME/.appvault` and falling back
/// to a directory under the system temp dir when no home is available.
fn resolve_data_dir() -> PathBuf {
    if let Some(home) = home_dir() {
        let user_dir = home.join(format!(".{APP_NAME}"));
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    std::env::temp_dir().join(APP_NAME)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default configuration file path.
pub fn default_config_file() -> PathBuf {
    data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the default disk-image directory.
pub fn default_storage_root() -> PathBuf {
    data_dir().join("images")
}

/// Returns the default directory holding mount points.
pub fn default_containers_root() -> PathBuf {
    home_dir().map_or_else(
        || data_dir().join("containers"),
        |home| home.join("Library").join("Containers"),
    )
}

/// Base directory for temporary mounts.
pub fn default_temporary_mounts_dir() -> PathBuf {
    data_dir().join("temporary-mounts")
}

/// Directory the host application writes per-app settings into.
pub fn default_settings_dir() -> PathBuf {
    default_containers_root()
        .join(DEFAULT_HOST_KEY)
        .join("App Settings")
}

/// Directory the host application installs bundles into.
pub fn default_applications_dir() -> PathBuf {
    default_containers_root()
        .join(DEFAULT_HOST_KEY)
        .join("Applications")
}

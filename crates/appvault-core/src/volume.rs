//! Disk-image volume operations layered over the volume utility.
//!
//! State-changing operations surface failures to the caller without retry.
//! Queries are advisory: any utility or parse failure yields `None`/`false`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use appvault_common::config::AppVaultConfig;
use appvault_common::error::{Result, UnmountFailureKind, VaultError};
use appvault_common::types::{Container, MountState, VolumeInfo, parent_disk, walk_up};
use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_until},
    character::complete::{char, digit1},
    combinator::recognize,
};

use crate::plist::{self, PlistValue};
use crate::process::{CommandRunner, CommandSpec};

/// Creates, attaches, detaches, and inspects container disk images.
pub struct VolumeManager {
    runner: Arc<dyn CommandRunner>,
    config: AppVaultConfig,
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("diskutil", &self.config.tools.diskutil)
            .finish_non_exhaustive()
    }
}

impl VolumeManager {
    /// Creates a manager that invokes utilities through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, config: AppVaultConfig) -> Self {
        Self { runner, config }
    }

    /// The configuration this manager was built with.
    pub const fn config(&self) -> &AppVaultConfig {
        &self.config
    }

    fn diskutil(&self) -> CommandSpec {
        CommandSpec::new(&self.config.tools.diskutil)
    }

    /// Returns the image path, creating a blank image first if none exists.
    ///
    /// The size defaults to the configured size for the container's key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Io`] if the storage directory cannot be created
    /// and [`VaultError::ImageCreationFailed`] if the utility fails.
    pub async fn ensure_image_exists(
        &self,
        container: &Container,
        size_hint: Option<&str>,
    ) -> Result<PathBuf> {
        if container.image_path.exists() {
            tracing::debug!(key = %container.key, "disk image already exists");
            return Ok(container.image_path.clone());
        }
        if let Some(parent) = container.image_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let size = size_hint.unwrap_or_else(|| self.config.image_size_for(&container.key));
        tracing::info!(key = %container.key, size, path = %container.image_path.display(), "creating disk image");
        let spec = self
            .diskutil()
            .args(["image", "create", "blank", "--format"])
            .arg(&self.config.image_format)
            .args(["--size", size, "--volumeName", container.volume_name()])
            .path_arg(&container.image_path);
        let _ = self.runner.run(&spec).await.map_err(|e| match e {
            VaultError::CommandFailed { stderr, .. } => VaultError::ImageCreationFailed {
                key: container.key.to_string(),
                stderr,
            },
            other => other,
        })?;
        Ok(container.image_path.clone())
    }

    /// Attaches the container's image at its mount point. A container that
    /// is already mounted is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MountFailed`] if the image is missing or the
    /// utility fails, and [`VaultError::Io`] if the mount point cannot be
    /// created.
    pub async fn mount(&self, container: &Container, nobrowse: bool) -> Result<()> {
        if self.is_mounted(container).await {
            tracing::debug!(key = %container.key, "already mounted");
            return Ok(());
        }
        self.attach(container, &container.mount_point, nobrowse).await?;
        tracing::info!(key = %container.key, mount_point = %container.mount_point.display(), "mounted");
        Ok(())
    }

    /// Attaches the container's image under `base/<key>` without exposing it
    /// to the desktop, returning the temporary mount point.
    ///
    /// # Errors
    ///
    /// Same as [`Self::mount`].
    pub async fn mount_temporarily(&self, container: &Container, base: &Path) -> Result<PathBuf> {
        let mount_point = base.join(container.key.as_str());
        self.attach(container, &mount_point, true).await?;
        tracing::info!(key = %container.key, mount_point = %mount_point.display(), "mounted temporarily");
        Ok(mount_point)
    }

    /// Force-unmounts a mount point returned by [`Self::mount_temporarily`].
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::UnmountFailed`] if the utility fails.
    pub async fn unmount_temporary(&self, container: &Container, mount_point: &Path) -> Result<()> {
        let spec = self.diskutil().args(["unmount", "force"]).path_arg(mount_point);
        tracing::info!(key = %container.key, mount_point = %mount_point.display(), "unmounting temporary mount");
        let _ = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| classify_unmount_failure(&mount_point.display().to_string(), e))?;
        Ok(())
    }

    async fn attach(&self, container: &Container, mount_point: &Path, nobrowse: bool) -> Result<()> {
        if !container.image_path.exists() {
            return Err(VaultError::MountFailed {
                key: container.key.to_string(),
                stderr: format!("disk image not found: {}", container.image_path.display()),
            });
        }
        std::fs::create_dir_all(mount_point).map_err(|e| VaultError::Io {
            path: mount_point.to_path_buf(),
            source: e,
        })?;
        let mut spec = self
            .diskutil()
            .args(["image", "attach"])
            .path_arg(&container.image_path)
            .arg("--mountPoint")
            .path_arg(mount_point);
        if nobrowse {
            spec = spec.arg("--nobrowse");
        }
        let _ = self.runner.run(&spec).await.map_err(|e| match e {
            VaultError::CommandFailed { stderr, .. } => VaultError::MountFailed {
                key: container.key.to_string(),
                stderr,
            },
            other => other,
        })?;
        Ok(())
    }

    /// Unmounts the container's volume. `force` unmounts even when files are
    /// open, at the risk of losing unflushed writes.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::UnmountFailed`] classified as busy or other.
    pub async fn unmount(&self, container: &Container, force: bool) -> Result<()> {
        let mut spec = self.diskutil().arg("unmount");
        if force {
            spec = spec.arg("force");
        }
        let spec = spec.path_arg(&container.mount_point);
        tracing::info!(key = %container.key, force, "unmounting");
        let _ = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| classify_unmount_failure(&container.mount_point.display().to_string(), e))?;
        Ok(())
    }

    /// Ejects the whole disk-image device backing the container, detaching
    /// every volume on it.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DeviceResolutionFailed`] if the device cannot be
    /// determined and [`VaultError::UnmountFailed`], naming the busy volumes
    /// where possible, if the utility fails.
    pub async fn eject(&self, container: &Container, force: bool) -> Result<()> {
        let info = self.info(&container.mount_point.to_string_lossy()).await;
        let Some(device) = info
            .as_ref()
            .and_then(|i| i.str_field("DeviceIdentifier"))
            .map(|d| parent_disk(d).to_string())
        else {
            return Err(VaultError::DeviceResolutionFailed {
                path: container.mount_point.clone(),
            });
        };
        let mut spec = self.diskutil().args(["eject", device.as_str()]);
        if force {
            spec = spec.arg("-force");
        }
        tracing::info!(key = %container.key, device = %device, force, "ejecting disk image");
        if let Err(e) = self.runner.run(&spec).await {
            return Err(self
                .describe_eject_failure(classify_unmount_failure(&device, e))
                .await);
        }
        Ok(())
    }

    /// Ejects an entire drive, e.g. the external disk holding the images.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::UnmountFailed`], naming the busy volumes where
    /// possible, if the utility fails.
    pub async fn eject_drive(&self, device: &str, force: bool) -> Result<()> {
        let mut spec = self.diskutil().arg("eject");
        if force {
            spec = spec.arg("-force");
        }
        let spec = spec.arg(device);
        tracing::info!(device, force, "ejecting drive");
        if let Err(e) = self.runner.run(&spec).await {
            return Err(self
                .describe_eject_failure(classify_unmount_failure(device, e))
                .await);
        }
        Ok(())
    }

    /// Fills in the volumes of the disk named by an `Unmount of diskN`
    /// diagnostic: the disk's own volume name followed by those of its
    /// partitions. Other errors, and failures without such a diagnostic,
    /// are returned unchanged.
    pub async fn describe_eject_failure(&self, err: VaultError) -> VaultError {
        let VaultError::UnmountFailed {
            target,
            kind,
            blocking_process,
            mut volume_names,
            stderr,
        } = err
        else {
            return err;
        };
        if let Some(disk) = failed_disk(&stderr) {
            for name in self.volume_names_on(disk).await {
                if !volume_names.contains(&name) {
                    volume_names.push(name);
                }
            }
            tracing::debug!(disk, volumes = ?volume_names, "busy disk described");
        }
        VaultError::UnmountFailed {
            target,
            kind,
            blocking_process,
            volume_names,
            stderr,
        }
    }

    async fn volume_names_on(&self, disk: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let info = self.info(disk).await;
        if let Some(name) = info
            .as_ref()
            .and_then(|i| i.str_field("VolumeName"))
            .filter(|n| !n.is_empty())
        {
            names.push(name.to_string());
        }
        let Some(list) = self.list_disk(disk).await else {
            return names;
        };
        let partitions = disks(&list)
            .iter()
            .filter_map(|d| d.get("Partitions").and_then(PlistValue::as_array))
            .flatten();
        for partition in partitions {
            let Some(name) = partition.str_field("VolumeName").filter(|n| !n.is_empty()) else {
                continue;
            };
            if !names.iter().any(|known| known == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Whether the container's own volume is attached at its mount point.
    pub async fn is_mounted(&self, container: &Container) -> bool {
        let info = self.info(&container.mount_point.to_string_lossy()).await;
        let mounted = info
            .as_ref()
            .and_then(|i| i.str_field("VolumeName"))
            .is_some_and(|name| name == container.volume_name());
        tracing::debug!(key = %container.key, mounted, "mount check");
        mounted
    }

    /// Current mount status, queried fresh.
    pub async fn mount_state(&self, container: &Container) -> MountState {
        let metadata = std::fs::metadata(&container.image_path).ok();
        let mounted = self.is_mounted(container).await;
        MountState {
            exists: metadata.is_some(),
            mounted,
            volume_path: mounted.then(|| container.mount_point.clone()),
            size_on_disk: metadata.as_ref().map(allocated_size),
        }
    }

    /// Whether `path` lives on a volume that is not internal.
    pub async fn is_external_drive(&self, path: &Path) -> bool {
        self.walk_up_info(path, |info| info.bool_field("Internal").map(|internal| !internal))
            .await
            .unwrap_or(false)
    }

    /// Device node of the volume holding `path`, e.g. `/dev/disk4s1`.
    pub async fn device_path(&self, path: &Path) -> Option<String> {
        self.walk_up_info(path, |info| info.str_field("DeviceNode").map(String::from))
            .await
    }

    /// Descriptive metadata of the volume holding `path`.
    pub async fn volume_info(&self, path: &Path) -> Option<VolumeInfo> {
        let mut info = self
            .walk_up_info(path, |plist| {
                plist.str_field("VolumeName").map(|name| VolumeInfo {
                    volume_name: Some(name.to_string()),
                    device_path: plist.str_field("DeviceNode").map(String::from),
                    device_identifier: plist.str_field("DeviceIdentifier").map(String::from),
                    media_name: plist.str_field("MediaName").map(String::from),
                })
            })
            .await?;
        if info.media_name.is_none() {
            if let Some(id) = info.device_identifier.clone() {
                if let Some(parent) = self.info(parent_disk(&id)).await {
                    info.media_name = parent
                        .str_field("MediaName")
                        .or_else(|| parent.str_field("IORegistryEntryName"))
                        .map(String::from);
                }
            }
        }
        Some(info)
    }

    /// Number of mounted volumes whose mount point lies under `base`.
    pub async fn count_mounted_volumes(&self, base: &Path) -> usize {
        let Some(list) = self.list().await else {
            return 0;
        };
        let base = base.to_string_lossy();
        let under = |entry: &PlistValue| {
            entry
                .str_field("MountPoint")
                .is_some_and(|mp| mp.starts_with(base.as_ref()))
        };
        disks(&list)
            .iter()
            .map(|disk| {
                let nested = ["Partitions", "APFSVolumes"]
                    .into_iter()
                    .filter_map(|k| disk.get(k).and_then(PlistValue::as_array))
                    .flatten()
                    .filter(|p| under(*p))
                    .count();
                nested + usize::from(under(disk))
            })
            .sum()
    }

    /// Ejects every attached disk-image device, returning how many were
    /// detached. Devices that refuse are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the disk listing itself cannot be obtained.
    pub async fn detach_all_disk_images(&self) -> Result<usize> {
        let output = self.runner.run(&self.diskutil().args(["list", "-plist"])).await?;
        let list = plist::parse(&output)?;
        let mut detached = 0;
        for disk in disks(&list) {
            let is_candidate = disk
                .str_field("Content")
                .is_some_and(|c| c.contains("Apple") || c.contains("Disk Image"));
            let Some(id) = disk.str_field("DeviceIdentifier").filter(|_| is_candidate) else {
                continue;
            };
            let Some(info) = self.info(id).await else {
                continue;
            };
            let is_image = info.bool_field("Virtual").unwrap_or(false)
                || info
                    .str_field("MediaName")
                    .is_some_and(|m| m.contains("Disk Image"));
            if !is_image {
                continue;
            }
            match self.runner.run(&self.diskutil().args(["eject", id])).await {
                Ok(_) => {
                    tracing::info!(device = id, "detached disk image");
                    detached += 1;
                }
                Err(e) => tracing::warn!(device = id, error = %e, "failed to detach disk image"),
            }
        }
        Ok(detached)
    }

    /// Resizes the container's image. The image must not be attached.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] for a missing image,
    /// [`VaultError::UnmountFailed`] (busy) when the image is in use, and
    /// [`VaultError::CommandFailed`] for any other utility failure.
    pub async fn resize_image(&self, container: &Container, size: &str) -> Result<()> {
        if !container.image_path.exists() {
            return Err(VaultError::Config {
                message: format!("disk image not found: {}", container.image_path.display()),
            });
        }
        let spec = CommandSpec::new(&self.config.tools.hdiutil)
            .args(["resize", "-size", size])
            .path_arg(&container.image_path);
        tracing::info!(key = %container.key, size, "resizing disk image");
        match self.runner.run(&spec).await {
            Ok(_) => Ok(()),
            Err(VaultError::CommandFailed { stderr, .. })
                if stderr.contains("mounted") || stderr.contains("in use") =>
            {
                Err(VaultError::UnmountFailed {
                    target: container.image_path.display().to_string(),
                    kind: UnmountFailureKind::Busy,
                    blocking_process: None,
                    volume_names: Vec::new(),
                    stderr,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Runs `diskutil info -plist <target>`.
    async fn info(&self, target: &str) -> Option<PlistValue> {
        let spec = self.diskutil().args(["info", "-plist", target]);
        let output = self.runner.run(&spec).await.ok()?;
        plist::parse(&output).ok()
    }

    async fn list(&self) -> Option<PlistValue> {
        let output = self
            .runner
            .run(&self.diskutil().args(["list", "-plist"]))
            .await
            .ok()?;
        plist::parse(&output).ok()
    }

    async fn list_disk(&self, disk: &str) -> Option<PlistValue> {
        let output = self
            .runner
            .run(&self.diskutil().args(["list", "-plist", disk]))
            .await
            .ok()?;
        plist::parse(&output).ok()
    }

    /// Queries `path` and each ancestor until `extract` yields a value.
    async fn walk_up_info<T>(
        &self,
        path: &Path,
        extract: impl Fn(&PlistValue) -> Option<T> + Send,
    ) -> Option<T> {
        for dir in walk_up(path) {
            if dir == Path::new("/") {
                break;
            }
            if let Some(info) = self.info(&dir.to_string_lossy()).await {
                if let Some(found) = extract(&info) {
                    return Some(found);
                }
            }
        }
        None
    }
}

fn disks(list: &PlistValue) -> &[PlistValue] {
    list.get("AllDisksAndPartitions")
        .and_then(PlistValue::as_array)
        .unwrap_or_default()
}

#[cfg(unix)]
fn allocated_size(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_size(meta: &std::fs::Metadata) -> u64 {
    meta.len()
}

/// Converts a failed unmount or eject into [`VaultError::UnmountFailed`],
/// classifying busy volumes from the utility's diagnostics.
pub fn classify_unmount_failure(target: &str, err: VaultError) -> VaultError {
    let VaultError::CommandFailed { stderr, .. } = err else {
        return err;
    };
    let blocking_process = blocking_process(&stderr);
    let lower = stderr.to_lowercase();
    let kind = if lower.contains("busy") || lower.contains("in use") || blocking_process.is_some()
    {
        UnmountFailureKind::Busy
    } else {
        UnmountFailureKind::Other
    };
    tracing::warn!(volume = target, %kind, blocking = ?blocking_process, "unmount refused");
    VaultError::UnmountFailed {
        target: target.to_string(),
        kind,
        blocking_process,
        volume_names: Vec::new(),
        stderr,
    }
}

/// `Unmount of diskN`, yielding `diskN`.
fn unmount_of(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag("Unmount of ")(input)?;
    recognize((tag("disk"), digit1)).parse(input)
}

/// Whole disk the utility failed to unmount, taken from diagnostics such as
/// `Unmount of disk5 failed: at least one volume could not be unmounted`.
#[must_use]
pub fn failed_disk(stderr: &str) -> Option<&str> {
    stderr
        .match_indices("Unmount of ")
        .find_map(|(pos, _)| unmount_of(&stderr[pos..]).ok().map(|(_, disk)| disk))
}

/// `PID <n> (<path>)`, yielding the path.
fn dissenter(input: &str) -> IResult<&str, &str> {
    let (input, _) = (tag("PID "), digit1, tag(" (")).parse(input)?;
    let (input, path) = take_until(")")(input)?;
    let (input, _) = char(')')(input)?;
    Ok((input, path))
}

/// Name of the process a utility reported as holding a volume, taken from
/// `PID <n> (<path>)` fragments such as
/// `Unmount of disk5 failed: at least one volume could not be unmounted:
/// dissented by PID 43014 (/usr/libexec/diskimagesiod)`.
#[must_use]
pub fn blocking_process(stderr: &str) -> Option<String> {
    stderr.match_indices("PID ").find_map(|(pos, _)| {
        dissenter(&stderr[pos..]).ok().map(|(_, path)| {
            path.rsplit('/')
                .next()
                .unwrap_or(path)
                .to_string()
        })
    })
}

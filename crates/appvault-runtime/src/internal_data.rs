//! Files left in an unmounted container's mount point.
//!
//! Attaching an image over a non-empty directory hides whatever the
//! application wrote there while the container was not mounted. Before
//! mounting, such files are found and either discarded, merged into the
//! image through a temporary mount, or left alone.

use std::fs;
use std::path::{Path, PathBuf};

use appvault_common::error::{Result, VaultError};
use appvault_common::types::{Container, InternalDataStrategy};
use appvault_core::volume::VolumeManager;

/// Desktop litter that never counts as data.
const IGNORED: [&str; 4] = [".DS_Store", "Desktop.ini", "Thumbs.db", "TemporaryItems"];

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> VaultError {
    move |source| VaultError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Top-level entries of the container's mount point that mounting would
/// hide, sorted. Hidden entries (including the lock sentinel), desktop
/// litter, and symbolic links are skipped. A missing mount point has none.
///
/// # Errors
///
/// Returns [`VaultError::Io`] if the mount point exists but cannot be read.
pub fn detect_internal_data(container: &Container) -> Result<Vec<PathBuf>> {
    let dir = &container.mount_point;
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || IGNORED.contains(&name.as_ref()) {
            continue;
        }
        let is_link = entry.file_type().map_err(io_error(dir))?.is_symlink();
        if !is_link {
            items.push(entry.path());
        }
    }
    items.sort();
    Ok(items)
}

/// Applies `strategy` to `items` found by [`detect_internal_data`].
///
/// Merging attaches the image under the configured temporary mounts
/// directory, copies every item into the volume root (replacing entries of
/// the same name), unmounts the temporary mount, and only then deletes the
/// originals. Any failure before that point leaves the originals in place.
///
/// # Errors
///
/// Returns the first I/O or utility error.
pub async fn handle_internal_data(
    volumes: &VolumeManager,
    container: &Container,
    items: &[PathBuf],
    strategy: InternalDataStrategy,
) -> Result<()> {
    tracing::info!(key = %container.key, %strategy, items = items.len(), "handling internal data");
    match strategy {
        InternalDataStrategy::Leave => Ok(()),
        InternalDataStrategy::Discard => remove_items(items),
        InternalDataStrategy::MergeThenDelete => {
            merge_into_image(volumes, container, items).await?;
            remove_items(items)
        }
    }
}

async fn merge_into_image(volumes: &VolumeManager, container: &Container, items: &[PathBuf]) -> Result<()> {
    let base = &volumes.config().temporary_mounts_dir;
    fs::create_dir_all(base).map_err(io_error(base))?;
    let mount_point = volumes.mount_temporarily(container, base).await?;
    let copied = items.iter().try_for_each(|item| {
        let Some(name) = item.file_name() else {
            return Ok(());
        };
        let destination = mount_point.join(name);
        remove_path(&destination)?;
        copy_recursive(item, &destination)
    });
    let detached = volumes.unmount_temporary(container, &mount_point).await;
    copied?;
    detached?;
    tracing::info!(key = %container.key, items = items.len(), "internal data merged into image");
    Ok(())
}

fn copy_recursive(src: &Path, dest: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).map_err(io_error(src))?;
    if meta.is_dir() {
        fs::create_dir_all(dest).map_err(io_error(dest))?;
        for entry in fs::read_dir(src).map_err(io_error(src))? {
            let entry = entry.map_err(io_error(src))?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else if meta.is_symlink() {
        let target = fs::read_link(src).map_err(io_error(src))?;
        std::os::unix::fs::symlink(target, dest).map_err(io_error(dest))?;
    } else {
        let _ = fs::copy(src, dest).map_err(io_error(src))?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(io_error(path))
    } else {
        fs::remove_file(path).map_err(io_error(path))
    }
}

fn remove_items(items: &[PathBuf]) -> Result<()> {
    items.iter().try_for_each(|item| remove_path(item))
}

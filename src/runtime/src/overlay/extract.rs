//! Materialize a snapshot as a directory tree on disk.

use std::path::{Path, PathBuf};

use squash_core::error::{Result, SquashError};

use super::snapshot::{FlatEntry, Snapshot};
use crate::archive::EntryKind;

impl Snapshot {
    /// Write the flattened snapshot below `dir`.
    ///
    /// Directories and regular files are always materialized; symlinks and
    /// hardlinks on Unix. Devices and FIFOs are skipped. Directory modes
    /// are applied last so read-only directories can still be filled.
    /// Returns the number of entries written.
    pub fn extract_to(&self, dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(dir).map_err(|e| {
            SquashError::Other(format!(
                "Failed to create extraction directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut written = 0;
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

        for flat in self.flatten() {
            let target = dir.join(&flat.entry.path);
            match &flat.entry.kind {
                EntryKind::Directory => {
                    std::fs::create_dir_all(&target)?;
                    dir_modes.push((target, flat.entry.mode));
                }
                EntryKind::RegularFile => {
                    write_file(&flat, &target)?;
                }
                EntryKind::Symlink { target: link } => {
                    create_parent(&target)?;
                    remove_existing(&target)?;
                    symlink(link, &target)?;
                }
                EntryKind::Hardlink { target: link } => {
                    create_parent(&target)?;
                    remove_existing(&target)?;
                    std::fs::hard_link(dir.join(link), &target).map_err(|e| {
                        SquashError::Other(format!(
                            "Failed to link {} to {}: {}",
                            flat.entry.path, link, e
                        ))
                    })?;
                }
                EntryKind::CharDevice { .. }
                | EntryKind::BlockDevice { .. }
                | EntryKind::Fifo
                | EntryKind::Deletion(_) => {
                    tracing::debug!(
                        path = %flat.entry.path,
                        kind = flat.entry.kind.name(),
                        "Skipping entry during extraction"
                    );
                    continue;
                }
            }
            written += 1;
        }

        // Deepest first, so a parent never loses write permission early.
        for (path, mode) in dir_modes.iter().rev() {
            set_mode(path, *mode)?;
        }

        tracing::debug!(dir = %dir.display(), entries = written, "Extracted snapshot");
        Ok(written)
    }
}

fn write_file(flat: &FlatEntry, target: &Path) -> Result<()> {
    let content = flat.content.as_ref().ok_or_else(|| {
        SquashError::Other(format!("No content spooled for {}", flat.entry.path))
    })?;
    create_parent(target)?;
    remove_existing(target)?;
    std::fs::copy(content.path(), target).map_err(|e| {
        SquashError::Other(format!(
            "Failed to write {}: {}",
            target.display(),
            e
        ))
    })?;
    set_mode(target, flat.entry.mode)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, path).map_err(|e| {
        SquashError::Other(format!(
            "Failed to create symlink {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
fn symlink(link: &str, path: &Path) -> Result<()> {
    tracing::debug!(path = %path.display(), target = link, "Symlinks unsupported, skipping");
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

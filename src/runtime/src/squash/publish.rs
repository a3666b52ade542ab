//! Atomic output publication.

use std::fs::File;
use std::path::{Path, PathBuf};

use squash_core::error::{Result, SquashError};
use tempfile::NamedTempFile;

/// Mode given to published archives.
const OUTPUT_MODE: u32 = 0o644;

/// A temporary file next to the destination that becomes the destination
/// on [`commit`](StagedOutput::commit). Dropping it uncommitted removes it.
#[derive(Debug)]
pub struct StagedOutput {
    file: NamedTempFile,
    output: PathBuf,
}

impl StagedOutput {
    /// Stage a new file in `output`'s directory.
    pub fn create(output: &Path) -> Result<Self> {
        let parent = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(SquashError::Other(format!(
                "Output directory {} does not exist",
                parent.display()
            )));
        }

        let file = tempfile::Builder::new()
            .prefix(".squash-")
            .suffix(".partial")
            .tempfile_in(parent)
            .map_err(|e| {
                SquashError::Other(format!(
                    "Failed to create temporary file in {}: {}",
                    parent.display(),
                    e
                ))
            })?;

        Ok(Self {
            file,
            output: output.to_path_buf(),
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.file.as_file_mut()
    }

    /// Staging path, for diagnostics.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Sync the staged file and rename it over the destination.
    pub fn commit(self) -> Result<PathBuf> {
        let file = self.file.as_file();
        set_output_mode(file)?;
        file.sync_all()?;

        self.file.persist(&self.output).map_err(|e| {
            SquashError::Other(format!(
                "Failed to move output into place at {}: {}",
                self.output.display(),
                e.error
            ))
        })?;

        tracing::debug!(output = %self.output.display(), "Published output");
        Ok(self.output)
    }
}

#[cfg(unix)]
fn set_output_mode(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(OUTPUT_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_output_mode(_file: &File) -> Result<()> {
    Ok(())
}

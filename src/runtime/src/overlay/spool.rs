//! On-disk spool for regular file contents held by a snapshot.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use squash_core::error::{Result, SquashError};

use crate::archive::Member;

/// Allocates content files inside a run's working area.
pub struct Spool {
    dir: PathBuf,
    next: u64,
}

impl Spool {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            SquashError::Other(format!(
                "Failed to create spool directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir, next: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy a member's body into a fresh spool file.
    pub fn store<R: Read>(&mut self, member: &mut Member<'_, R>) -> Result<Arc<SpooledContent>> {
        let path = self.dir.join(format!("{:010}", self.next));
        self.next += 1;

        // Removes the partial file if the copy fails.
        let mut content = SpooledContent { path, size: 0 };

        let file = File::create(&content.path)?;
        let mut writer = BufWriter::new(file);
        content.size = member.copy_content(&mut writer)?;
        writer.flush()?;

        Ok(Arc::new(content))
    }
}

/// A regular file's bytes, spooled to disk. The file is removed once the
/// last reference goes away.
#[derive(Debug)]
pub struct SpooledContent {
    path: PathBuf,
    size: u64,
}

impl SpooledContent {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| {
            SquashError::Other(format!(
                "Failed to open spooled content {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl Drop for SpooledContent {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

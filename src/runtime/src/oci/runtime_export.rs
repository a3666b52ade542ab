//! Local container runtime source.
//!
//! Exports an image from the local Docker or Podman store with
//! `<runtime> save` and reads the result like any saved archive.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use squash_core::error::{Result, SquashError};
use tokio::process::Command;

use super::docker_archive::DockerArchiveSource;
use super::source::{ImageSource, ResolvedImage};

/// Which local runtime holds the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn program(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

/// Image source backed by `docker save` / `podman save`.
#[derive(Debug, Clone)]
pub struct RuntimeExportSource {
    runtime: ContainerRuntime,
    program: PathBuf,
}

impl RuntimeExportSource {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime,
            program: PathBuf::from(runtime.program()),
        }
    }

    /// Run a different executable with the same command line.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn export(&self, reference: &str, output: &Path) -> Result<()> {
        tracing::info!(
            runtime = self.runtime.program(),
            reference,
            "Exporting image from local runtime"
        );

        let result = Command::new(&self.program)
            .arg("save")
            .arg("-o")
            .arg(output)
            .arg(reference)
            .output()
            .await
            .map_err(|e| {
                SquashError::Other(format!(
                    "Failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(SquashError::Other(format!(
                "{} save {} failed ({}): {}",
                self.runtime.program(),
                reference,
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageSource for RuntimeExportSource {
    fn name(&self) -> &'static str {
        self.runtime.program()
    }

    async fn resolve(&self, reference: &str, scratch: &Path) -> Result<ResolvedImage> {
        tokio::fs::create_dir_all(scratch).await?;
        let exported = scratch.join("runtime-export.tar");
        self.export(reference, &exported).await?;

        let resolved = DockerArchiveSource::new()
            .with_tag(reference)
            .with_name(reference)
            .resolve(&exported.display().to_string(), scratch)
            .await;

        // The unpacked copy is all that is needed from here on.
        if let Err(e) = tokio::fs::remove_file(&exported).await {
            tracing::debug!(path = %exported.display(), error = %e, "Could not remove export");
        }
        resolved
    }
}

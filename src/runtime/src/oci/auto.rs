//! Source selection by reference shape.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use squash_core::error::{Result, SquashError};
use squash_core::RegistryConfig;

use super::docker_archive::DockerArchiveSource;
use super::layout::OciLayoutSource;
use super::registry::RegistrySource;
use super::runtime_export::{ContainerRuntime, RuntimeExportSource};
use super::source::{ImageSource, ResolvedImage};

/// Dispatches on the reference: an existing directory is an OCI layout,
/// an existing file is a saved archive, anything else goes to a registry.
pub struct AutoSource {
    registry: RegistrySource,
    layout: OciLayoutSource,
    archive: DockerArchiveSource,
}

impl AutoSource {
    pub fn new(registry: RegistryConfig) -> Self {
        Self {
            registry: RegistrySource::new(registry),
            layout: OciLayoutSource::new(),
            archive: DockerArchiveSource::new(),
        }
    }

    fn pick(&self, reference: &str) -> &dyn ImageSource {
        let path = Path::new(reference);
        if path.is_dir() || is_layout_with_ref_name(reference) {
            &self.layout
        } else if path.is_file() {
            &self.archive
        } else {
            &self.registry
        }
    }
}

fn is_layout_with_ref_name(reference: &str) -> bool {
    reference
        .rsplit_once(':')
        .map_or(false, |(path, name)| !name.contains('/') && Path::new(path).join("oci-layout").is_file())
}

#[async_trait]
impl ImageSource for AutoSource {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn resolve(&self, reference: &str, scratch: &Path) -> Result<ResolvedImage> {
        let source = self.pick(reference);
        tracing::debug!(reference, source = source.name(), "Selected image source");
        source.resolve(reference, scratch).await
    }
}

/// Named image source, as chosen on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceKind {
    #[default]
    Auto,
    Registry,
    Oci,
    Archive,
    Docker,
    Podman,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Auto => "auto",
            SourceKind::Registry => "registry",
            SourceKind::Oci => "oci",
            SourceKind::Archive => "archive",
            SourceKind::Docker => "docker",
            SourceKind::Podman => "podman",
        }
    }

    /// Build the source. Registry settings only matter for `Auto` and
    /// `Registry`.
    pub fn build(self, registry: &RegistryConfig) -> Arc<dyn ImageSource> {
        match self {
            SourceKind::Auto => Arc::new(AutoSource::new(registry.clone())),
            SourceKind::Registry => Arc::new(RegistrySource::new(registry.clone())),
            SourceKind::Oci => Arc::new(OciLayoutSource::new()),
            SourceKind::Archive => Arc::new(DockerArchiveSource::new()),
            SourceKind::Docker => Arc::new(RuntimeExportSource::new(ContainerRuntime::Docker)),
            SourceKind::Podman => Arc::new(RuntimeExportSource::new(ContainerRuntime::Podman)),
        }
    }
}

impl FromStr for SourceKind {
    type Err = SquashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(SourceKind::Auto),
            "registry" => Ok(SourceKind::Registry),
            "oci" => Ok(SourceKind::Oci),
            "archive" => Ok(SourceKind::Archive),
            "docker" => Ok(SourceKind::Docker),
            "podman" => Ok(SourceKind::Podman),
            other => Err(SquashError::ConfigError(format!(
                "Unknown image source '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

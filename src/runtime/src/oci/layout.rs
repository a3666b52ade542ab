//! OCI image layout source.
//!
//! Reads an on-disk layout (`oci-layout`, `index.json`, `blobs/<algo>/<hex>`).
//! Layer blobs are used in place and never copied.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest as OciManifest, MediaType};
use squash_core::error::{Result, SquashError};

use super::source::{
    FetchedLayer, ImageManifest, ImageSource, LayerAccessor, LayerDescriptor, ResolvedImage,
};

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
/// Nested indexes deeper than this are rejected.
const MAX_INDEX_DEPTH: usize = 4;

/// Image source over an OCI image layout directory.
///
/// The reference is the layout path, optionally followed by `:<ref-name>`
/// to select a manifest by its `org.opencontainers.image.ref.name`
/// annotation.
#[derive(Debug, Default)]
pub struct OciLayoutSource;

impl OciLayoutSource {
    pub fn new() -> Self {
        Self
    }

    /// Parse and validate a layout, returning its manifest and blob paths.
    pub fn load(root: &Path, ref_name: Option<&str>) -> Result<(ImageManifest, Vec<PathBuf>)> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root.join(required).exists() {
                return Err(SquashError::Other(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root.display()
                )));
            }
        }

        let index: ImageIndex = read_json(&root.join("index.json"), "index.json")?;
        let descriptor = select_manifest(root, &index, ref_name, 0)?;
        let digest = descriptor.digest().to_string();
        let manifest: OciManifest = read_json(&blob_path(root, &digest)?, "manifest")?;

        let mut layers = Vec::with_capacity(manifest.layers().len());
        let mut paths = Vec::with_capacity(manifest.layers().len());
        for layer in manifest.layers() {
            paths.push(blob_path(root, layer.digest())?);
            layers.push(LayerDescriptor {
                digest: layer.digest().to_string(),
                media_type: layer.media_type().to_string(),
                size: u64::try_from(layer.size()).unwrap_or(0),
            });
        }

        Ok((
            ImageManifest {
                reference: root.display().to_string(),
                digest: Some(digest),
                layers,
            },
            paths,
        ))
    }
}

#[async_trait]
impl ImageSource for OciLayoutSource {
    fn name(&self) -> &'static str {
        "oci"
    }

    async fn resolve(&self, reference: &str, _scratch: &Path) -> Result<ResolvedImage> {
        let (root, ref_name) = split_layout_reference(reference);
        tracing::info!(layout = %root.display(), ref_name = ?ref_name, "Reading OCI layout");

        let (manifest, paths) = Self::load(&root, ref_name.as_deref())?;
        let layers = manifest
            .layers
            .iter()
            .cloned()
            .zip(paths)
            .map(|(descriptor, path)| {
                Arc::new(LocalBlob { descriptor, path }) as Arc<dyn LayerAccessor>
            })
            .collect();

        Ok(ResolvedImage { manifest, layers })
    }
}

/// A blob already on local disk, used in place.
pub(crate) struct LocalBlob {
    pub(crate) descriptor: LayerDescriptor,
    pub(crate) path: PathBuf,
}

#[async_trait]
impl LayerAccessor for LocalBlob {
    fn descriptor(&self) -> &LayerDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, _scratch: &Path) -> Result<FetchedLayer> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(SquashError::Other(format!(
                "Layer blob {} is missing",
                self.path.display()
            )));
        }
        Ok(FetchedLayer::borrowed(&self.path))
    }
}

/// `path` or `path:ref-name`. The suffix only counts when `path` alone is
/// an existing directory and the full string is not.
fn split_layout_reference(reference: &str) -> (PathBuf, Option<String>) {
    let whole = PathBuf::from(reference);
    if whole.is_dir() {
        return (whole, None);
    }
    match reference.rsplit_once(':') {
        Some((path, name)) if !name.contains('/') && Path::new(path).is_dir() => {
            (PathBuf::from(path), Some(name.to_string()))
        }
        _ => (whole, None),
    }
}

fn select_manifest(
    root: &Path,
    index: &ImageIndex,
    ref_name: Option<&str>,
    depth: usize,
) -> Result<Descriptor> {
    if depth > MAX_INDEX_DEPTH {
        return Err(SquashError::Other("OCI index nesting is too deep".to_string()));
    }

    let candidates = index.manifests();
    let chosen = match ref_name {
        Some(name) => candidates
            .iter()
            .find(|d| annotation(d, REF_NAME_ANNOTATION) == Some(name))
            .ok_or_else(|| {
                SquashError::Other(format!("No manifest named '{}' in {}", name, root.display()))
            })?,
        None => candidates
            .iter()
            .find(|d| is_host_platform(d))
            .or_else(|| candidates.first())
            .ok_or_else(|| SquashError::Other("No manifests in index.json".to_string()))?,
    };

    if *chosen.media_type() == MediaType::ImageIndex {
        let nested: ImageIndex = read_json(&blob_path(root, chosen.digest())?, "image index")?;
        return select_manifest(root, &nested, None, depth + 1);
    }

    Ok(chosen.clone())
}

fn annotation<'a>(descriptor: &'a Descriptor, key: &str) -> Option<&'a str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn is_host_platform(descriptor: &Descriptor) -> bool {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    descriptor.platform().as_ref().map_or(false, |p| {
        p.os().to_string() == "linux" && p.architecture().to_string() == arch
    })
}

fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    let (algorithm, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
    let safe = |s: &str| !s.is_empty() && !s.contains('/') && s != "..";
    if !safe(algorithm) || !safe(hex) {
        return Err(SquashError::Other(format!("Invalid blob digest '{}'", digest)));
    }
    Ok(root.join("blobs").join(algorithm).join(hex))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SquashError::Other(format!(
            "Failed to read {} at {}: {}",
            what,
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| SquashError::SerializationError(format!("Failed to parse {}: {}", what, e)))
}

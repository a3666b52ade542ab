//! Image source abstraction.
//!
//! An [`ImageSource`] turns a user reference into a manifest plus one
//! [`LayerAccessor`] per layer. Accessors defer the actual download or file
//! open until [`LayerAccessor::fetch`] is called.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use squash_core::error::{Result, SquashError};

use crate::archive::{LayerCompression, LayerDecoder};

/// A layer as declared by the image manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerDescriptor {
    pub digest: String,
    /// Empty when the source does not declare one (docker-save archives).
    pub media_type: String,
    pub size: u64,
}

/// Manifest summary for a resolved image. Layers are bottom-most first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageManifest {
    pub reference: String,
    /// Manifest digest, when the source knows it.
    pub digest: Option<String>,
    pub layers: Vec<LayerDescriptor>,
}

/// A manifest plus lazy access to each declared layer.
pub struct ResolvedImage {
    pub manifest: ImageManifest,
    pub layers: Vec<Arc<dyn LayerAccessor>>,
}

impl std::fmt::Debug for ResolvedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedImage")
            .field("manifest", &self.manifest)
            .field("layers", &self.layers.len())
            .finish()
    }
}

/// Resolves references into images.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Short name for logs (`registry`, `oci`, `archive`, ...).
    fn name(&self) -> &'static str;

    /// Resolve `reference`. `scratch` is the run's working area; sources
    /// may unpack or download metadata into it.
    async fn resolve(&self, reference: &str, scratch: &Path) -> Result<ResolvedImage>;
}

/// Deferred access to a single layer blob.
#[async_trait]
pub trait LayerAccessor: Send + Sync {
    fn descriptor(&self) -> &LayerDescriptor;

    /// Make the blob available as a local file, downloading into `scratch`
    /// if needed.
    async fn fetch(&self, scratch: &Path) -> Result<FetchedLayer>;
}

/// A layer blob on local disk.
///
/// Blobs the run downloaded are owned and removed on drop; blobs that
/// belong to the user (an OCI layout, an unpacked archive) are borrowed.
#[derive(Debug)]
pub struct FetchedLayer {
    path: PathBuf,
    owned: bool,
    index: usize,
    descriptor: LayerDescriptor,
    compression: Option<LayerCompression>,
}

impl FetchedLayer {
    /// A blob the run created; deleted on drop.
    pub fn owned(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), true)
    }

    /// A blob that must be left in place.
    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), false)
    }

    fn new(path: PathBuf, owned: bool) -> Self {
        Self {
            path,
            owned,
            index: 0,
            descriptor: LayerDescriptor::default(),
            compression: None,
        }
    }

    /// Attach the manifest position and the compression implied by the
    /// media type (`None` means detect from the blob).
    pub(crate) fn assign(
        mut self,
        index: usize,
        descriptor: LayerDescriptor,
        compression: Option<LayerCompression>,
    ) -> Self {
        self.index = index;
        self.descriptor = descriptor;
        self.compression = compression;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &LayerDescriptor {
        &self.descriptor
    }

    /// Open the blob as a layer stream.
    pub fn open(self, strip_prefix: Option<String>) -> Result<LayerArchive> {
        let compression = match self.compression {
            Some(compression) => compression,
            None => LayerCompression::sniff_file(&self.path)?,
        };

        let file = File::open(&self.path).map_err(|e| {
            SquashError::Other(format!(
                "Failed to open layer blob {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let reader = compression.open(BufReader::new(file))?;

        tracing::trace!(
            layer = self.index,
            path = %self.path.display(),
            compression = ?compression,
            "Opened layer blob"
        );

        Ok(LayerArchive {
            index: self.index,
            descriptor: self.descriptor.clone(),
            decoder: LayerDecoder::new(reader).with_strip_prefix(strip_prefix),
            _blob: self,
        })
    }
}

impl Drop for FetchedLayer {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// An open, read-once layer stream. Dropping it closes the stream and
/// releases the underlying blob.
pub struct LayerArchive {
    index: usize,
    descriptor: LayerDescriptor,
    decoder: LayerDecoder<Box<dyn Read + Send>>,
    _blob: FetchedLayer,
}

impl LayerArchive {
    /// Position in the manifest, bottom-most layer is 0.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn descriptor(&self) -> &LayerDescriptor {
        &self.descriptor
    }

    pub fn decoder_mut(&mut self) -> &mut LayerDecoder<Box<dyn Read + Send>> {
        &mut self.decoder
    }
}

/// Strip the algorithm from a `sha256:<hex>` digest, for blob file names.
pub(crate) fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}

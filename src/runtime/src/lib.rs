//! Image Squash Runtime - layer squashing engine.
//!
//! Resolves an image from a registry, an OCI layout, a `docker save`
//! archive or a local container runtime, folds its layers in order with
//! whiteout semantics, and publishes the resulting filesystem as a single
//! uncompressed or gzip layer archive.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod oci;
pub mod overlay;
pub mod squash;

// Re-export common types
pub use archive::{ArchiveEncoder, Entry, EntryKind, LayerCompression, LayerDecoder, OutputSink};
pub use oci::{
    AutoSource, DockerArchiveSource, ImageManifest, ImageReference, ImageSource, LayerDescriptor,
    OciLayoutSource, RegistrySource, ResolvedImage, RuntimeExportSource, SourceKind,
};
pub use overlay::{Overlay, Snapshot};
pub use squash::{SquashReport, SquashState, Squasher};

/// Image Squash Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Image sources and layer enumeration.
//!
//! ```text
//! reference ──► ImageSource::resolve ──► ResolvedImage
//!                                          │ manifest (layers bottom → top)
//!                                          │ LayerAccessor per layer
//!                                          ▼
//!                plan_layers ──► fetch_layers ──► FetchedLayer::open ──► LayerArchive
//! ```
//!
//! Sources: registry (`oci-distribution`), OCI image layout directory,
//! `docker save` archive, local Docker/Podman export, and [`AutoSource`]
//! which picks one from the reference.

mod auto;
pub mod credentials;
mod docker_archive;
mod layers;
mod layout;
pub mod reference;
pub mod registry;
mod runtime_export;
mod source;

pub use auto::{AutoSource, SourceKind};
pub use credentials::DockerCredentials;
pub use docker_archive::DockerArchiveSource;
pub use layers::{classify_media_type, fetch_layers, plan_layers, LayerPlan, LayerStream};
pub use layout::OciLayoutSource;
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistrySource};
pub use runtime_export::{ContainerRuntime, RuntimeExportSource};
pub use source::{
    FetchedLayer, ImageManifest, ImageSource, LayerAccessor, LayerArchive, LayerDescriptor,
    ResolvedImage,
};

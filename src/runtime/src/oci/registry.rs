//! Registry image source.
//!
//! Resolves references against an OCI distribution registry with the
//! `oci-distribution` client. Only the manifest is fetched up front; layer
//! blobs are streamed to the working area when the enumerator asks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use squash_core::error::{Result, SquashError};
use squash_core::RegistryConfig;
use tokio::io::AsyncWriteExt;

use super::credentials::DockerCredentials;
use super::reference::ImageReference;
use super::source::{
    digest_hex, FetchedLayer, ImageManifest, ImageSource, LayerAccessor, LayerDescriptor,
    ResolvedImage,
};

/// Registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, anonymous unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Pick credentials for `registry`: explicit config first, then the
    /// Docker config file, then the environment.
    pub fn resolve(config: &RegistryConfig, registry: &str) -> Result<Self> {
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            return Ok(Self::basic(username.clone(), password.clone()));
        }

        let docker_config = config
            .docker_config
            .clone()
            .or_else(DockerCredentials::default_path);
        if let Some(path) = docker_config {
            if let Some((username, password)) = DockerCredentials::load(&path)?.get(registry) {
                tracing::debug!(registry, path = %path.display(), "Using Docker config credentials");
                return Ok(Self::basic(username, password));
            }
        }

        Ok(Self::from_env())
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls image manifests and layer blobs from a registry.
pub struct RegistrySource {
    client: Arc<Client>,
    config: RegistryConfig,
    auth: Option<RegistryAuth>,
}

impl RegistrySource {
    pub fn new(config: RegistryConfig) -> Self {
        let protocol = if config.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        });
        Self {
            client: Arc::new(client),
            config,
            auth: None,
        }
    }

    /// Use fixed credentials instead of resolving them per registry.
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    fn auth_for(&self, registry: &str) -> Result<RegistryAuth> {
        match &self.auth {
            Some(auth) => Ok(auth.clone()),
            None => RegistryAuth::resolve(&self.config, registry),
        }
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn resolve(&self, reference: &str, _scratch: &Path) -> Result<ResolvedImage> {
        let image_ref = ImageReference::parse(reference)?;
        let oci_ref = to_oci_reference(&image_ref);
        let auth = self.auth_for(&image_ref.registry)?;

        tracing::info!(
            reference = %image_ref,
            anonymous = auth.is_anonymous(),
            "Resolving image from registry"
        );

        // Resolves multi-arch indexes to the linux image for this host.
        let (manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth.to_oci_auth())
            .await
            .map_err(|e| SquashError::RegistryError {
                registry: image_ref.registry.clone(),
                message: format!("Failed to pull manifest: {}", e),
            })?;

        let mut descriptors = Vec::with_capacity(manifest.layers.len());
        let mut layers: Vec<Arc<dyn LayerAccessor>> = Vec::with_capacity(manifest.layers.len());
        for (index, layer) in manifest.layers.iter().enumerate() {
            let descriptor = LayerDescriptor {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
                size: u64::try_from(layer.size).unwrap_or(0),
            };
            descriptors.push(descriptor.clone());
            layers.push(Arc::new(RegistryLayer {
                client: Arc::clone(&self.client),
                reference: oci_ref.clone(),
                registry: image_ref.registry.clone(),
                blob: layer.clone(),
                descriptor,
                index,
            }));
        }

        tracing::debug!(
            reference = %image_ref,
            digest = %digest,
            layers = descriptors.len(),
            "Resolved registry manifest"
        );

        Ok(ResolvedImage {
            manifest: ImageManifest {
                reference: image_ref.to_string(),
                digest: Some(digest),
                layers: descriptors,
            },
            layers,
        })
    }
}

/// A layer blob still on the registry.
struct RegistryLayer {
    client: Arc<Client>,
    reference: Reference,
    registry: String,
    blob: OciDescriptor,
    descriptor: LayerDescriptor,
    /// Position in the manifest; a digest may repeat.
    index: usize,
}

#[async_trait]
impl LayerAccessor for RegistryLayer {
    fn descriptor(&self) -> &LayerDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, scratch: &Path) -> Result<FetchedLayer> {
        let blobs = scratch.join("blobs");
        tokio::fs::create_dir_all(&blobs).await?;

        let path = blobs.join(blob_file_name(self.index, &self.descriptor.digest));
        // Owned from here on, so a failed download is cleaned up.
        let fetched = FetchedLayer::owned(&path);

        tracing::debug!(
            digest = %self.descriptor.digest,
            size = self.descriptor.size,
            "Downloading layer blob"
        );

        let mut file = tokio::fs::File::create(&path).await?;
        self.client
            .pull_blob(&self.reference, &self.blob, &mut file)
            .await
            .map_err(|e| SquashError::RegistryError {
                registry: self.registry.clone(),
                message: format!("Failed to pull layer {}: {}", self.descriptor.digest, e),
            })?;
        file.flush().await?;

        Ok(fetched)
    }
}

/// Download target for one manifest layer, unique even when digests repeat.
fn blob_file_name(index: usize, digest: &str) -> String {
    format!("{}-{}", index, digest_hex(digest))
}

fn to_oci_reference(reference: &ImageReference) -> Reference {
    match (&reference.digest, &reference.tag) {
        (Some(digest), _) => Reference::with_digest(
            reference.registry.clone(),
            reference.repository.clone(),
            digest.clone(),
        ),
        (None, Some(tag)) => Reference::with_tag(
            reference.registry.clone(),
            reference.repository.clone(),
            tag.clone(),
        ),
        (None, None) => Reference::with_tag(
            reference.registry.clone(),
            reference.repository.clone(),
            "latest".to_string(),
        ),
    }
}

/// Picks the linux image for the host CPU from a multi-arch index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

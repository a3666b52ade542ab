//! `docker save` / `podman save` archive source.
//!
//! The outer archive is unpacked into the working area and its
//! `manifest.json` lists the layer tars bottom to top.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use squash_core::error::{Result, SquashError};

use super::layout::LocalBlob;
use super::source::{ImageManifest, ImageSource, LayerAccessor, LayerDescriptor, ResolvedImage};
use crate::archive::LayerCompression;

/// One image in a saved archive's `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SavedImage {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// Image source over a saved image archive (plain or gzip-compressed tar).
#[derive(Debug, Default)]
pub struct DockerArchiveSource {
    tag: Option<String>,
    name: Option<String>,
}

impl DockerArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the image carrying `tag` among the archive's `RepoTags`.
    /// Without a tag, or when the archive holds a single untagged image,
    /// the first image is used.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Name reported for an image saved without `RepoTags`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Read an already unpacked archive directory.
    pub fn load(&self, root: &Path, reference: &str) -> Result<(ImageManifest, Vec<PathBuf>)> {
        let manifest_path = root.join("manifest.json");
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            SquashError::MalformedArchive(format!(
                "Image archive has no readable manifest.json: {}",
                e
            ))
        })?;
        let images: Vec<SavedImage> = serde_json::from_str(&content).map_err(|e| {
            SquashError::SerializationError(format!("Failed to parse manifest.json: {}", e))
        })?;

        let image = self.select(&images)?;

        let mut descriptors = Vec::with_capacity(image.layers.len());
        let mut paths = Vec::with_capacity(image.layers.len());
        for layer in &image.layers {
            let path = member_path(root, layer)?;
            let size = std::fs::metadata(&path)
                .map_err(|e| {
                    SquashError::MalformedArchive(format!("Layer {} is missing: {}", layer, e))
                })?
                .len();
            descriptors.push(LayerDescriptor {
                digest: digest_from_member(layer),
                media_type: String::new(),
                size,
            });
            paths.push(path);
        }

        let name = image
            .repo_tags
            .as_ref()
            .and_then(|tags| tags.first())
            .cloned()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| reference.to_string());

        Ok((
            ImageManifest {
                reference: name,
                digest: Some(digest_from_member(&image.config)),
                layers: descriptors,
            },
            paths,
        ))
    }

    fn select<'a>(&self, images: &'a [SavedImage]) -> Result<&'a SavedImage> {
        let Some(tag) = &self.tag else {
            return images.first().ok_or_else(|| {
                SquashError::EmptyImage("image archive lists no images".to_string())
            });
        };

        let tagged = images.iter().find(|image| {
            image
                .repo_tags
                .as_ref()
                .map_or(false, |tags| tags.iter().any(|t| tag_matches(t, tag)))
        });
        if let Some(image) = tagged {
            return Ok(image);
        }

        // An image saved by ID or digest carries no RepoTags at all.
        match images {
            [only] if only.repo_tags.as_ref().map_or(true, Vec::is_empty) => {
                tracing::debug!(tag = %tag, "Archive image is untagged, using it");
                Ok(only)
            }
            _ => Err(SquashError::InvalidReference {
                reference: tag.clone(),
                message: "not present in image archive".to_string(),
            }),
        }
    }
}

#[async_trait]
impl ImageSource for DockerArchiveSource {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn resolve(&self, reference: &str, scratch: &Path) -> Result<ResolvedImage> {
        let archive = PathBuf::from(reference);
        let target = scratch.join("image-archive");
        tracing::info!(archive = %archive.display(), "Unpacking image archive");

        let unpack_target = target.clone();
        tokio::task::spawn_blocking(move || unpack(&archive, &unpack_target))
            .await
            .map_err(|e| SquashError::Other(format!("Archive unpack task failed: {}", e)))??;

        let (manifest, paths) = self.load(&target, reference)?;
        tracing::debug!(
            reference = %manifest.reference,
            layers = manifest.layers.len(),
            "Read image archive manifest"
        );

        let layers = manifest
            .layers
            .iter()
            .cloned()
            .zip(paths)
            .map(|(descriptor, path)| {
                // Identical layers share one member, so blobs stay borrowed.
                Arc::new(LocalBlob { descriptor, path }) as Arc<dyn LayerAccessor>
            })
            .collect();

        Ok(ResolvedImage { manifest, layers })
    }
}

fn unpack(archive: &Path, target: &Path) -> Result<()> {
    let compression = LayerCompression::sniff_file(archive)?;
    let file = File::open(archive).map_err(|e| {
        SquashError::Other(format!(
            "Failed to open image archive {}: {}",
            archive.display(),
            e
        ))
    })?;
    let reader = compression.open(BufReader::new(file))?;

    std::fs::create_dir_all(target)?;
    tar::Archive::new(reader).unpack(target).map_err(|e| {
        SquashError::MalformedArchive(format!(
            "Failed to unpack image archive {}: {}",
            archive.display(),
            e
        ))
    })
}

/// Resolve a manifest member name inside the unpacked archive.
fn member_path(root: &Path, member: &str) -> Result<PathBuf> {
    if member.split('/').any(|s| s == "..") || member.starts_with('/') {
        return Err(SquashError::PathTraversal(member.to_string()));
    }
    Ok(root.join(member))
}

/// `<hex>/layer.tar`, `<hex>.json` and `blobs/sha256/<hex>` all carry the
/// hex digest in their name.
fn digest_from_member(member: &str) -> String {
    if let Some(hex) = member.strip_prefix("blobs/sha256/") {
        return format!("sha256:{}", hex);
    }
    let stem = member.split('/').next().unwrap_or(member);
    let stem = stem.strip_suffix(".json").unwrap_or(stem);
    format!("sha256:{}", stem)
}

/// Compare repo tags, letting `nginx` match `nginx:latest` and
/// `docker.io/library/nginx:latest`.
fn tag_matches(candidate: &str, wanted: &str) -> bool {
    let with_tag = |s: &str| {
        let last = s.rsplit('/').next().unwrap_or(s);
        if last.contains(':') {
            s.to_string()
        } else {
            format!("{}:latest", s)
        }
    };
    let strip_hub = |s: String| {
        s.strip_prefix("docker.io/library/")
            .or_else(|| s.strip_prefix("docker.io/"))
            .or_else(|| s.strip_prefix("localhost/"))
            .map(str::to_string)
            .unwrap_or(s)
    };
    strip_hub(with_tag(candidate)) == strip_hub(with_tag(wanted))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    fn append(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    /// Build a saved-image archive with the given layer tars.
    pub(crate) fn saved_archive(tag: &str, layers: &[Vec<u8>]) -> Vec<u8> {
        saved_archive_with_tags(serde_json::json!([tag]), layers)
    }

    /// Like [`saved_archive`] with a raw `RepoTags` value, e.g. `null`.
    pub(crate) fn saved_archive_with_tags(
        repo_tags: serde_json::Value,
        layers: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut names = Vec::new();
        for (i, layer) in layers.iter().enumerate() {
            let name = format!("{:064x}/layer.tar", i + 1);
            append(&mut builder, &name, layer);
            names.push(name);
        }
        let config = format!("{:064x}.json", 0xc0);
        append(&mut builder, &config, b"{}");
        let manifest = serde_json::json!([{
            "Config": config,
            "RepoTags": repo_tags,
            "Layers": names,
        }]);
        append(&mut builder, "manifest.json", &serde_json::to_vec(&manifest).unwrap());
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_tag_matching() {
        assert!(tag_matches("nginx:latest", "nginx"));
        assert!(tag_matches("docker.io/library/nginx:latest", "nginx:latest"));
        assert!(tag_matches("localhost/app:dev", "app:dev"));
        assert!(!tag_matches("nginx:1.25", "nginx"));
        assert!(!tag_matches("other:latest", "nginx"));
    }

    #[test]
    fn test_digest_from_member() {
        assert_eq!(digest_from_member("abc/layer.tar"), "sha256:abc");
        assert_eq!(digest_from_member("def.json"), "sha256:def");
        assert_eq!(digest_from_member("blobs/sha256/123"), "sha256:123");
    }

    #[test]
    fn test_member_path_rejects_traversal() {
        let root = Path::new("/work");
        assert!(matches!(
            member_path(root, "../etc/layer.tar"),
            Err(SquashError::PathTraversal(_))
        ));
        assert!(member_path(root, "/abs/layer.tar").is_err());
        assert_eq!(member_path(root, "a/layer.tar").unwrap(), root.join("a/layer.tar"));
    }

    #[tokio::test]
    async fn test_resolve_saved_archive() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("image.tar");
        std::fs::write(&archive, saved_archive("app:v1", &[b"one".to_vec(), b"two!".to_vec()]))
            .unwrap();

        let scratch = tmp.path().join("scratch");
        let resolved = DockerArchiveSource::new()
            .with_tag("app:v1")
            .resolve(&archive.display().to_string(), &scratch)
            .await
            .unwrap();

        assert_eq!(resolved.manifest.reference, "app:v1");
        assert_eq!(resolved.manifest.layers.len(), 2);
        assert_eq!(resolved.manifest.layers[1].size, 4);
        assert_eq!(resolved.manifest.layers[0].media_type, "");
        assert!(resolved.manifest.layers[0].digest.starts_with("sha256:"));

        let fetched = resolved.layers[1].fetch(&scratch).await.unwrap();
        assert_eq!(std::fs::read(fetched.path()).unwrap(), b"two!");
    }

    #[tokio::test]
    async fn test_resolve_unknown_tag() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("image.tar");
        std::fs::write(&archive, saved_archive("app:v1", &[b"one".to_vec()])).unwrap();

        let err = DockerArchiveSource::new()
            .with_tag("app:v2")
            .resolve(&archive.display().to_string(), tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SquashError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn test_tag_falls_back_to_sole_untagged_image() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("image.tar");
        let bytes = saved_archive_with_tags(serde_json::Value::Null, &[b"one".to_vec()]);
        std::fs::write(&archive, bytes).unwrap();

        let resolved = DockerArchiveSource::new()
            .with_tag("app:v2")
            .with_name("app:v2")
            .resolve(&archive.display().to_string(), &tmp.path().join("scratch"))
            .await
            .unwrap();
        assert_eq!(resolved.manifest.reference, "app:v2");
        assert_eq!(resolved.layers.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("not-an-image.tar");
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "readme", b"hello");
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let err = DockerArchiveSource::new()
            .resolve(&archive.display().to_string(), tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SquashError::MalformedArchive(_)));
    }
}

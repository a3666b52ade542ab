//! Layer enumeration.
//!
//! Validates a resolved image's layers and acquires them ahead of the fold
//! while handing them out strictly in manifest order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use squash_core::error::{Result, SquashError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::source::{FetchedLayer, LayerAccessor, LayerDescriptor, ResolvedImage};
use crate::archive::LayerCompression;

/// One layer scheduled for fetching.
#[derive(Clone)]
pub struct LayerPlan {
    /// Position in the manifest, bottom-most layer is 0.
    pub index: usize,
    pub descriptor: LayerDescriptor,
    /// `None` when the blob must be sniffed.
    pub compression: Option<LayerCompression>,
    accessor: Arc<dyn LayerAccessor>,
}

impl std::fmt::Debug for LayerPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerPlan")
            .field("index", &self.index)
            .field("descriptor", &self.descriptor)
            .field("compression", &self.compression)
            .finish()
    }
}

/// Map a layer media type to the compression it implies.
///
/// Returns `Ok(None)` for an empty media type, meaning "detect from the
/// blob's magic bytes".
pub fn classify_media_type(index: usize, media_type: &str) -> Result<Option<LayerCompression>> {
    let compression = match media_type {
        "" => return Ok(None),
        "application/vnd.oci.image.layer.v1.tar"
        | "application/vnd.oci.image.layer.nondistributable.v1.tar"
        | "application/vnd.docker.image.rootfs.diff.tar" => LayerCompression::None,
        "application/vnd.oci.image.layer.v1.tar+gzip"
        | "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
        | "application/vnd.docker.image.rootfs.diff.tar.gzip"
        | "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => LayerCompression::Gzip,
        "application/vnd.oci.image.layer.v1.tar+zstd"
        | "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd" => LayerCompression::Zstd,
        other => {
            return Err(SquashError::UnsupportedMediaType {
                index,
                media_type: other.to_string(),
            })
        }
    };
    Ok(Some(compression))
}

/// Validate the image's layers and produce the fetch plan, bottom-most
/// layer first.
pub fn plan_layers(image: &ResolvedImage) -> Result<Vec<LayerPlan>> {
    let declared = &image.manifest.layers;
    if declared.is_empty() {
        return Err(SquashError::EmptyImage(image.manifest.reference.clone()));
    }
    if declared.len() != image.layers.len() {
        return Err(SquashError::Other(format!(
            "Manifest declares {} layers but {} are accessible",
            declared.len(),
            image.layers.len()
        )));
    }

    declared
        .iter()
        .zip(&image.layers)
        .enumerate()
        .map(|(index, (descriptor, accessor))| {
            Ok(LayerPlan {
                index,
                descriptor: descriptor.clone(),
                compression: classify_media_type(index, &descriptor.media_type)?,
                accessor: Arc::clone(accessor),
            })
        })
        .collect()
}

/// Layers in manifest order, fetched ahead by a background task.
///
/// Dropping the stream stops the producer; blobs already fetched but not
/// consumed are released with it.
pub struct LayerStream {
    rx: mpsc::Receiver<Result<FetchedLayer>>,
    producer: JoinHandle<()>,
}

impl LayerStream {
    /// The next layer, or `None` when every layer has been handed out or
    /// after the first failure.
    pub async fn next(&mut self) -> Option<Result<FetchedLayer>> {
        self.rx.recv().await
    }
}

impl Drop for LayerStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Start fetching `plans` with up to `prefetch` layers in flight.
///
/// Must be called within a Tokio runtime.
pub fn fetch_layers(plans: Vec<LayerPlan>, scratch: PathBuf, prefetch: usize) -> LayerStream {
    let prefetch = prefetch.max(1);
    let (tx, rx) = mpsc::channel(prefetch);

    let producer = tokio::spawn(async move {
        let mut fetches = futures::stream::iter(plans.into_iter().map(|plan| {
            let scratch = scratch.clone();
            async move { fetch_one(plan, &scratch).await }
        }))
        .buffered(prefetch);

        while let Some(result) = fetches.next().await {
            let failed = result.is_err();
            if tx.send(result).await.is_err() {
                tracing::debug!("Layer consumer went away, stopping prefetch");
                break;
            }
            if failed {
                break;
            }
        }
    });

    LayerStream { rx, producer }
}

async fn fetch_one(plan: LayerPlan, scratch: &Path) -> Result<FetchedLayer> {
    tracing::debug!(
        layer = plan.index,
        digest = %plan.descriptor.digest,
        size = plan.descriptor.size,
        "Fetching layer"
    );

    let fetched = plan
        .accessor
        .fetch(scratch)
        .await
        .map_err(|e| SquashError::LayerFetchFailed {
            index: plan.index,
            digest: plan.descriptor.digest.clone(),
            source: Box::new(e),
        })?;

    Ok(fetched.assign(plan.index, plan.descriptor, plan.compression))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::source::ImageManifest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct SlowLayer {
        descriptor: LayerDescriptor,
        delay_ms: u64,
        fail: bool,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LayerAccessor for SlowLayer {
        fn descriptor(&self) -> &LayerDescriptor {
            &self.descriptor
        }

        async fn fetch(&self, scratch: &Path) -> Result<FetchedLayer> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SquashError::Other("connection reset".to_string()));
            }
            let path = scratch.join(&self.descriptor.digest);
            tokio::fs::write(&path, b"blob").await?;
            Ok(FetchedLayer::owned(path))
        }
    }

    fn image(delays: &[u64], failing: Option<usize>, fetches: &Arc<AtomicUsize>) -> ResolvedImage {
        let mut descriptors = Vec::new();
        let mut layers: Vec<Arc<dyn LayerAccessor>> = Vec::new();
        for (i, delay) in delays.iter().enumerate() {
            let descriptor = LayerDescriptor {
                digest: format!("layer{}", i),
                media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
                size: 4,
            };
            descriptors.push(descriptor.clone());
            layers.push(Arc::new(SlowLayer {
                descriptor,
                delay_ms: *delay,
                fail: failing == Some(i),
                fetches: Arc::clone(fetches),
            }));
        }
        ResolvedImage {
            manifest: ImageManifest {
                reference: "test".to_string(),
                digest: None,
                layers: descriptors,
            },
            layers,
        }
    }

    #[test]
    fn test_classify_media_types() {
        assert_eq!(
            classify_media_type(0, "application/vnd.oci.image.layer.v1.tar+gzip").unwrap(),
            Some(LayerCompression::Gzip)
        );
        assert_eq!(
            classify_media_type(0, "application/vnd.docker.image.rootfs.diff.tar.gzip").unwrap(),
            Some(LayerCompression::Gzip)
        );
        assert_eq!(
            classify_media_type(0, "application/vnd.oci.image.layer.v1.tar+zstd").unwrap(),
            Some(LayerCompression::Zstd)
        );
        assert_eq!(
            classify_media_type(0, "application/vnd.oci.image.layer.nondistributable.v1.tar").unwrap(),
            Some(LayerCompression::None)
        );
        assert_eq!(classify_media_type(0, "").unwrap(), None);
    }

    #[test]
    fn test_classify_rejects_non_tar() {
        let err = classify_media_type(2, "application/vnd.cncf.helm.chart.content.v1.tar+gzip")
            .unwrap_err();
        match err {
            SquashError::UnsupportedMediaType { index, media_type } => {
                assert_eq!(index, 2);
                assert!(media_type.contains("helm"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_plan_rejects_empty_image() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let err = plan_layers(&image(&[], None, &fetches)).unwrap_err();
        assert!(matches!(err, SquashError::EmptyImage(_)));
    }

    #[test]
    fn test_plan_rejects_accessor_mismatch() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let mut resolved = image(&[0, 0], None, &fetches);
        resolved.layers.pop();
        assert!(matches!(plan_layers(&resolved), Err(SquashError::Other(_))));
    }

    #[test]
    fn test_plan_keeps_manifest_order() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let plans = plan_layers(&image(&[0, 0, 0], None, &fetches)).unwrap();
        let digests: Vec<&str> = plans.iter().map(|p| p.descriptor.digest.as_str()).collect();
        assert_eq!(digests, vec!["layer0", "layer1", "layer2"]);
        assert_eq!(plans[1].index, 1);
    }

    #[tokio::test]
    async fn test_fetch_yields_in_manifest_order() {
        let tmp = TempDir::new().unwrap();
        let fetches = Arc::new(AtomicUsize::new(0));
        // The first layer is the slowest; order must still hold.
        let plans = plan_layers(&image(&[60, 5, 20, 1], None, &fetches)).unwrap();

        let mut stream = fetch_layers(plans, tmp.path().to_path_buf(), 3);
        let mut seen = Vec::new();
        while let Some(layer) = stream.next().await {
            let layer = layer.unwrap();
            seen.push((layer.index(), layer.descriptor().digest.clone()));
        }
        assert_eq!(
            seen,
            vec![
                (0, "layer0".to_string()),
                (1, "layer1".to_string()),
                (2, "layer2".to_string()),
                (3, "layer3".to_string()),
            ]
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fetch_failure_stops_stream() {
        let tmp = TempDir::new().unwrap();
        let fetches = Arc::new(AtomicUsize::new(0));
        let plans = plan_layers(&image(&[0, 0, 0], Some(1), &fetches)).unwrap();

        let mut stream = fetch_layers(plans, tmp.path().to_path_buf(), 1);
        assert!(stream.next().await.unwrap().is_ok());
        match stream.next().await.unwrap() {
            Err(SquashError::LayerFetchFailed { index, digest, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(digest, "layer1");
            }
            other => panic!("unexpected result: {:?}", other.map(|l| l.index())),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fetched_blobs_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let fetches = Arc::new(AtomicUsize::new(0));
        let plans = plan_layers(&image(&[0], None, &fetches)).unwrap();

        let mut stream = fetch_layers(plans, tmp.path().to_path_buf(), 1);
        let layer = stream.next().await.unwrap().unwrap();
        let path = layer.path().to_path_buf();
        assert!(path.exists());
        drop(layer);
        assert!(!path.exists());
    }
}

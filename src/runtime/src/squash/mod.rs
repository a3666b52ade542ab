//! Squash orchestration.
//!
//! Drives one run end to end: resolve the image, fold its layers in
//! manifest order, encode the snapshot into a staged file next to the
//! destination and rename it into place. Everything the run creates lives
//! in a private working area that is removed when the run ends, whatever
//! the outcome.

mod publish;
mod state;

pub use publish::StagedOutput;
pub use state::{SquashState, StateMachine};

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use squash_core::error::{Result, SquashError, Stage};
use squash_core::{OutputCompression, SquashConfig};
use tokio_util::sync::CancellationToken;

use crate::archive::OutputSink;
use crate::oci::{fetch_layers, plan_layers, ImageManifest, ImageSource};
use crate::overlay::{Overlay, Snapshot};

/// Outcome of a successful squash.
#[derive(Debug, Clone, Serialize)]
pub struct SquashReport {
    /// Canonical reference of the squashed image
    pub reference: String,
    pub output: PathBuf,
    /// Layers folded
    pub layers: usize,
    /// Members in the published archive
    pub entries: usize,
    /// Published archive size in bytes
    pub size: u64,
    /// `sha256:` digest of the published bytes
    pub digest: String,
    pub state: SquashState,
}

/// Squashes images from one source.
pub struct Squasher {
    config: SquashConfig,
    source: Arc<dyn ImageSource>,
    cancel: CancellationToken,
    extract_dir: Option<PathBuf>,
}

impl Squasher {
    pub fn new(config: SquashConfig, source: Arc<dyn ImageSource>) -> Self {
        Self {
            config,
            source,
            cancel: CancellationToken::new(),
            extract_dir: None,
        }
    }

    /// Use an externally controlled cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Also materialize the squashed filesystem under `dir`.
    pub fn with_extract_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extract_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &SquashConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve `reference` without fetching any layer.
    pub async fn inspect(&self, reference: &str) -> Result<ImageManifest> {
        let work = self.work_area()?;
        let image = self
            .source
            .resolve(reference, work.path())
            .await
            .map_err(|e| annotate(e, Stage::Fetch, None))?;
        Ok(image.manifest)
    }

    /// Squash `reference` into a single layer archive at `output`.
    ///
    /// `output` is written exactly once, by a final rename; on failure or
    /// cancellation it is left as it was.
    pub async fn squash(&self, reference: &str, output: &Path) -> Result<SquashReport> {
        let mut machine = StateMachine::new();
        match self.run(reference, output, &mut machine).await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::warn!(reference, state = %machine.state(), error = %e, "Squash failed");
                machine.fail();
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        reference: &str,
        output: &Path,
        machine: &mut StateMachine,
    ) -> Result<SquashReport> {
        self.config.validate()?;
        let work = self.work_area()?;
        let scratch = work.path().to_path_buf();

        machine.advance(SquashState::FetchingLayers)?;
        self.check_cancelled()?;
        let image = self
            .source
            .resolve(reference, &scratch)
            .await
            .map_err(|e| annotate(e, Stage::Fetch, None))?;
        let plans = plan_layers(&image).map_err(|e| annotate(e, Stage::Fetch, None))?;
        let layer_count = plans.len();
        let canonical = image.manifest.reference.clone();

        tracing::info!(
            reference = %canonical,
            source = self.source.name(),
            layers = layer_count,
            work_dir = %scratch.display(),
            "Squashing image"
        );

        let mut layers = fetch_layers(plans, scratch.clone(), self.config.prefetch_layers);

        machine.advance(SquashState::Materializing)?;
        let mut overlay = Overlay::new(scratch.join("spool"))?;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SquashError::Cancelled),
                next = layers.next() => next,
            };
            let Some(fetched) = next else { break };

            let fetched = fetched.map_err(|e| {
                let layer = match &e {
                    SquashError::LayerFetchFailed { index, .. } => Some(*index),
                    _ => None,
                };
                annotate(e, Stage::Fetch, layer)
            })?;
            let index = fetched.index();

            self.check_cancelled()?;
            let archive = fetched
                .open(self.config.strip_prefix.clone())
                .map_err(|e| annotate(e, Stage::Decode, Some(index)))?;

            let cancel = self.cancel.clone();
            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = overlay.apply_layer(archive, &cancel);
                (overlay, result)
            })
            .await
            .map_err(|e| {
                SquashError::Other(format!("Fold task failed: {}", e)).at(Stage::Fold, Some(index))
            })?;
            overlay = returned;

            let stats = result.map_err(|e| {
                let stage = if e.is_codec_error() {
                    Stage::Decode
                } else {
                    Stage::Fold
                };
                annotate(e, stage, Some(index))
            })?;

            tracing::info!(
                layer = index,
                of = layer_count,
                members = stats.members,
                deletions = stats.deletions,
                live = overlay.snapshot().len(),
                "Layer folded"
            );
        }
        drop(layers);

        if overlay.layers() != layer_count {
            return Err(SquashError::Other(format!(
                "Only {} of {} layers were delivered",
                overlay.layers(),
                layer_count
            ))
            .at(Stage::Fetch, Some(overlay.layers())));
        }
        let snapshot = overlay.into_snapshot();

        machine.advance(SquashState::Encoding)?;
        self.check_cancelled()?;
        let staged = StagedOutput::create(output).map_err(|e| annotate(e, Stage::Publish, None))?;

        let cancel = self.cancel.clone();
        let compression = self.config.output_compression;
        let extract_dir = self.extract_dir.clone();
        let (staged, encoded) = tokio::task::spawn_blocking(move || {
            let mut staged = staged;
            let encoded = encode_snapshot(
                &snapshot,
                staged.file_mut(),
                compression,
                &cancel,
                extract_dir.as_deref(),
            );
            (staged, encoded)
        })
        .await
        .map_err(|e| {
            SquashError::Other(format!("Encode task failed: {}", e)).at(Stage::Encode, None)
        })?;
        let encoded = encoded.map_err(|e| annotate(e, Stage::Encode, None))?;

        machine.advance(SquashState::Publishing)?;
        self.check_cancelled()?;
        let output = staged
            .commit()
            .map_err(|e| annotate(e, Stage::Publish, None))?;
        machine.advance(SquashState::Done)?;

        tracing::info!(
            reference = %canonical,
            output = %output.display(),
            entries = encoded.entries,
            size = encoded.size,
            digest = %encoded.digest,
            "Squash complete"
        );

        Ok(SquashReport {
            reference: canonical,
            output,
            layers: layer_count,
            entries: encoded.entries,
            size: encoded.size,
            digest: encoded.digest,
            state: machine.state(),
        })
    }

    fn work_area(&self) -> Result<tempfile::TempDir> {
        let root = self.config.work_root();
        std::fs::create_dir_all(&root).map_err(|e| {
            SquashError::Other(format!(
                "Failed to create work directory {}: {}",
                root.display(),
                e
            ))
        })?;
        tempfile::Builder::new()
            .prefix("squash-")
            .tempdir_in(&root)
            .map_err(|e| {
                SquashError::Other(format!(
                    "Failed to create working area in {}: {}",
                    root.display(),
                    e
                ))
            })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SquashError::Cancelled);
        }
        Ok(())
    }
}

/// Attach a stage to `err`. Cancellation stays bare so callers can match it.
fn annotate(err: SquashError, stage: Stage, layer: Option<usize>) -> SquashError {
    match err {
        SquashError::Cancelled => err,
        err => err.at(stage, layer),
    }
}

struct Encoded {
    entries: usize,
    size: u64,
    digest: String,
}

fn encode_snapshot(
    snapshot: &Snapshot,
    file: &mut std::fs::File,
    compression: OutputCompression,
    cancel: &CancellationToken,
    extract_dir: Option<&Path>,
) -> Result<Encoded> {
    let sink = OutputSink::new(HashingWriter::new(BufWriter::new(file)), compression);
    let (sink, entries) = snapshot.write_archive(sink, cancel)?;
    let hashing = sink.finish()?;
    let (mut inner, digest, size) = hashing.finalize();
    inner.flush()?;

    if let Some(dir) = extract_dir {
        snapshot.extract_to(dir)?;
    }

    Ok(Encoded {
        entries,
        size,
        digest,
    })
}

/// Writer that hashes and counts everything passed through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Return the inner writer, the `sha256:` digest and the byte count.
    pub fn finalize(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_writer_digest() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"abc").unwrap();
        let (inner, digest, size) = writer.finalize();
        assert_eq!(inner, b"abc");
        assert_eq!(size, 3);
        assert_eq!(
            digest,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_annotate_keeps_cancellation_bare() {
        assert!(matches!(
            annotate(SquashError::Cancelled, Stage::Fold, Some(1)),
            SquashError::Cancelled
        ));
        let err = annotate(SquashError::MalformedArchive("x".into()), Stage::Decode, Some(2));
        assert_eq!(err.stage(), Some(Stage::Decode));
        assert_eq!(err.layer(), Some(2));
    }
}

//! Filesystem overlay materializer.
//!
//! Folds layers bottom to top into a [`Snapshot`] using overlay semantics:
//! last writer wins per path, whiteouts hide lower layers, opaque markers
//! empty a directory of lower-layer content.

mod extract;
mod snapshot;
mod spool;

pub use snapshot::{FlatEntry, Snapshot, SnapshotEntry};
pub use spool::{Spool, SpooledContent};

use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use squash_core::error::{Result, SquashError};
use tokio_util::sync::CancellationToken;

use crate::archive::{Deletion, Entry, EntryKind, LayerDecoder};
use crate::oci::LayerArchive;

/// Counters for one folded layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub index: usize,
    /// Members read from the layer, deletions included
    pub members: usize,
    pub deletions: usize,
    /// Snapshot paths removed by deletions or replacements
    pub removed: usize,
    /// Regular file bytes spooled
    pub bytes: u64,
}

/// Owns the snapshot and its content spool for a single run.
pub struct Overlay {
    snapshot: Snapshot,
    spool: Spool,
    layers: usize,
}

impl Overlay {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            snapshot: Snapshot::new(),
            spool: Spool::new(spool_dir)?,
            layers: 0,
        })
    }

    /// Layers folded so far.
    pub fn layers(&self) -> usize {
        self.layers
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> Snapshot {
        self.snapshot
    }

    /// Fold one fetched layer. The layer stream is closed on return.
    pub fn apply_layer(
        &mut self,
        mut layer: LayerArchive,
        cancel: &CancellationToken,
    ) -> Result<LayerStats> {
        let index = layer.index();
        let stats = self.apply_decoder(index, layer.decoder_mut(), cancel)?;
        tracing::debug!(
            layer = index,
            digest = %layer.descriptor().digest,
            members = stats.members,
            deletions = stats.deletions,
            removed = stats.removed,
            bytes = stats.bytes,
            "Folded layer"
        );
        Ok(stats)
    }

    /// Fold the members of `decoder` as layer `index`.
    pub fn apply_decoder<R: Read>(
        &mut self,
        index: usize,
        decoder: &mut LayerDecoder<R>,
        cancel: &CancellationToken,
    ) -> Result<LayerStats> {
        if cancel.is_cancelled() {
            return Err(SquashError::Cancelled);
        }

        let mut stats = LayerStats {
            index,
            ..Default::default()
        };
        // Paths this layer has written; its own deletions never touch them.
        let mut added: HashSet<String> = HashSet::new();

        for member in decoder.entries()? {
            if cancel.is_cancelled() {
                return Err(SquashError::Cancelled);
            }
            let mut member = member?;
            stats.members += 1;

            match member.entry().kind.clone() {
                EntryKind::Deletion(Deletion::Whiteout) => {
                    let path = &member.entry().path;
                    stats.deletions += 1;
                    stats.removed += self.snapshot.remove(path, &added);
                    stats.removed += self.snapshot.remove_descendants(path, &added);
                }
                EntryKind::Deletion(Deletion::Opaque) => {
                    let path = &member.entry().path;
                    stats.deletions += 1;
                    stats.removed += self.snapshot.remove_descendants(path, &added);
                }
                EntryKind::RegularFile => {
                    let content = self.spool.store(&mut member)?;
                    stats.bytes += content.size();
                    stats.removed += self.place(member.into_entry(), Some(content), &mut added);
                }
                EntryKind::Hardlink { target } => {
                    let content = self.snapshot.get(&target).and_then(|t| t.content.clone());
                    if content.is_none() {
                        tracing::debug!(
                            layer = index,
                            path = %member.entry().path,
                            target = %target,
                            "Hardlink target has no content"
                        );
                    }
                    stats.removed += self.place(member.into_entry(), content, &mut added);
                }
                _ => {
                    stats.removed += self.place(member.into_entry(), None, &mut added);
                }
            }
        }

        self.layers += 1;
        Ok(stats)
    }

    fn place(
        &mut self,
        entry: Entry,
        content: Option<Arc<SpooledContent>>,
        added: &mut HashSet<String>,
    ) -> usize {
        let mut removed = self.snapshot.remove_non_directory_ancestors(&entry.path);
        if !entry.is_dir() {
            removed += self.snapshot.remove_descendants(&entry.path, &HashSet::new());
        }
        added.insert(entry.path.clone());
        self.snapshot.insert(SnapshotEntry { entry, content });
        removed
    }
}

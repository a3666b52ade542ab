//! The merged filesystem view and its flattening into a single archive.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{Read, Write};
use std::ops::Bound;
use std::sync::Arc;

use squash_core::error::{Result, SquashError};
use tokio_util::sync::CancellationToken;

use super::spool::SpooledContent;
use crate::archive::{ancestors, ArchiveEncoder, Entry, EntryKind};

/// A live path in the snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub entry: Entry,
    /// Spooled bytes for regular files and resolved hardlinks.
    pub content: Option<Arc<SpooledContent>>,
}

/// One member of the flattened output, ready to encode.
#[derive(Debug, Clone)]
pub struct FlatEntry {
    pub entry: Entry,
    pub content: Option<Arc<SpooledContent>>,
    /// Synthesized parent directory with no explicit entry.
    pub implied: bool,
}

/// Path-keyed view of the image after folding some prefix of its layers.
///
/// Keys are normalized paths, so iteration is lexicographic and every
/// directory sorts before its descendants.
#[derive(Debug, Default)]
pub struct Snapshot {
    entries: BTreeMap<String, SnapshotEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Live paths in lexicographic order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SnapshotEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn insert(&mut self, item: SnapshotEntry) {
        self.entries.insert(item.entry.path.clone(), item);
    }

    /// Remove `path` itself unless it is in `keep`.
    pub(crate) fn remove(&mut self, path: &str, keep: &HashSet<String>) -> usize {
        if keep.contains(path) {
            return 0;
        }
        usize::from(self.entries.remove(path).is_some())
    }

    /// Remove every path strictly below `dir` that is not in `keep`.
    /// The root is `""`.
    pub(crate) fn remove_descendants(&mut self, dir: &str, keep: &HashSet<String>) -> usize {
        let doomed: Vec<String> = self
            .descendant_keys(dir)
            .filter(|path| !keep.contains(*path))
            .map(String::from)
            .collect();
        for path in &doomed {
            self.entries.remove(path);
        }
        doomed.len()
    }

    /// Remove any ancestor of `path` that is not a directory.
    pub(crate) fn remove_non_directory_ancestors(&mut self, path: &str) -> usize {
        let doomed: Vec<String> = ancestors(path)
            .filter(|a| self.entries.get(*a).map_or(false, |e| !e.entry.is_dir()))
            .map(String::from)
            .collect();
        for path in &doomed {
            self.entries.remove(path);
        }
        doomed.len()
    }

    fn descendant_keys<'s>(&'s self, dir: &str) -> Box<dyn Iterator<Item = &'s str> + 's> {
        if dir.is_empty() {
            return Box::new(self.entries.keys().map(String::as_str));
        }
        // `dir/` .. `dir0` covers exactly the keys below `dir`; '0' follows '/'.
        let lower = format!("{}/", dir);
        let upper = format!("{}0", dir);
        Box::new(
            self.entries
                .range::<str, _>((Bound::Included(lower.as_str()), Bound::Excluded(upper.as_str())))
                .map(|(k, _)| k.as_str()),
        )
    }

    /// Flatten the snapshot into emission order.
    ///
    /// Parents without an explicit entry are synthesized. Hardlinks stay
    /// links only when their target is emitted earlier with the same
    /// content; otherwise they are written as regular files.
    pub fn flatten(&self) -> Vec<FlatEntry> {
        let mut implied = BTreeSet::new();
        for path in self.entries.keys() {
            for ancestor in ancestors(path) {
                if !self.entries.contains_key(ancestor) {
                    implied.insert(ancestor.to_string());
                }
            }
        }

        let mut merged: BTreeMap<&str, FlatEntry> = BTreeMap::new();
        for path in &implied {
            merged.insert(
                path.as_str(),
                FlatEntry {
                    entry: Entry::implied_directory(path.as_str()),
                    content: None,
                    implied: true,
                },
            );
        }
        for (path, item) in &self.entries {
            merged.insert(
                path.as_str(),
                FlatEntry {
                    entry: self.resolve_hardlink(item),
                    content: item.content.clone(),
                    implied: false,
                },
            );
        }

        merged.into_values().collect()
    }

    fn resolve_hardlink(&self, item: &SnapshotEntry) -> Entry {
        let EntryKind::Hardlink { target } = &item.entry.kind else {
            return item.entry.clone();
        };
        let Some(content) = &item.content else {
            // Dangling in every layer seen; nothing to materialize.
            return item.entry.clone();
        };

        let linkable = target.as_str() < item.entry.path.as_str()
            && self.entries.get(target).map_or(false, |t| {
                t.entry.kind == EntryKind::RegularFile
                    && t.content.as_ref().map_or(false, |c| Arc::ptr_eq(c, content))
            });
        if linkable {
            return item.entry.clone();
        }

        let mut entry = item.entry.clone();
        entry.kind = EntryKind::RegularFile;
        entry.size = content.size();
        entry
    }

    /// Encode the flattened snapshot into `sink`.
    ///
    /// Returns the sink and the number of members written.
    pub fn write_archive<W: Write>(
        &self,
        sink: W,
        cancel: &CancellationToken,
    ) -> Result<(W, usize)> {
        let mut encoder = ArchiveEncoder::new(sink);
        for flat in self.flatten() {
            if cancel.is_cancelled() {
                return Err(SquashError::Cancelled);
            }
            match (&flat.entry.kind, &flat.content) {
                (EntryKind::RegularFile, Some(content)) => {
                    let mut file = content.open()?;
                    encoder.append(&flat.entry, Some(&mut file as &mut dyn Read))?;
                }
                (EntryKind::RegularFile, None) => {
                    return Err(SquashError::Other(format!(
                        "No content spooled for {}",
                        flat.entry.path
                    )));
                }
                _ => encoder.append(&flat.entry, None)?,
            }
        }
        let written = encoder.appended();
        Ok((encoder.finish()?, written))
    }
}

//! Archive entry model and member path normalization.

use std::collections::BTreeMap;

use squash_core::error::{Result, SquashError};

/// Whiteout file prefix used by overlay filesystems.
///
/// A member named `.wh.<name>` removes `<name>` from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque whiteout marker filename.
///
/// A member named `.wh..wh..opq` hides every lower-layer entry inside its
/// directory. The directory itself stays.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Mode given to directories that only exist because something lives below them.
pub const IMPLIED_DIR_MODE: u32 = 0o755;

/// What kind of deletion a marker requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// Remove the path and everything below it.
    Whiteout,
    /// Remove everything below the directory, keep the directory.
    Opaque,
}

/// Type of an archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink { target: String },
    /// Target is a normalized archive path.
    Hardlink { target: String },
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
    Fifo,
    Deletion(Deletion),
}

impl EntryKind {
    /// Short lowercase name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::RegularFile => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink { .. } => "symlink",
            EntryKind::Hardlink { .. } => "hardlink",
            EntryKind::CharDevice { .. } => "char",
            EntryKind::BlockDevice { .. } => "block",
            EntryKind::Fifo => "fifo",
            EntryKind::Deletion(Deletion::Whiteout) => "whiteout",
            EntryKind::Deletion(Deletion::Opaque) => "opaque",
        }
    }
}

/// A single archive member, without its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Normalized archive-relative path (`usr/bin/env`)
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits
    pub mode: u32,
    /// Content length; zero for everything but regular files
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
    pub username: Option<String>,
    pub groupname: Option<String>,
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    /// Extended attributes from PAX `SCHILY.xattr.*` records
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Entry {
    /// Create an entry with root ownership and no timestamps.
    pub fn new(path: impl Into<String>, kind: EntryKind, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind,
            mode,
            size: 0,
            uid: 0,
            gid: 0,
            username: None,
            groupname: None,
            mtime: 0,
            xattrs: BTreeMap::new(),
        }
    }

    /// Regular file entry of the given size.
    pub fn file(path: impl Into<String>, mode: u32, size: u64) -> Self {
        let mut entry = Self::new(path, EntryKind::RegularFile, mode);
        entry.size = size;
        entry
    }

    /// Directory entry.
    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        Self::new(path, EntryKind::Directory, mode)
    }

    /// Directory synthesized for a parent that has no explicit entry.
    pub fn implied_directory(path: impl Into<String>) -> Self {
        Self::new(path, EntryKind::Directory, IMPLIED_DIR_MODE)
    }

    /// Whiteout removing `path`.
    pub fn whiteout(path: impl Into<String>) -> Self {
        Self::new(path, EntryKind::Deletion(Deletion::Whiteout), 0o644)
    }

    /// Opaque marker for directory `path` (empty string for the root).
    pub fn opaque(path: impl Into<String>) -> Self {
        Self::new(path, EntryKind::Deletion(Deletion::Opaque), 0o644)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self.kind, EntryKind::Deletion(_))
    }

    /// Member name this entry is written under. Deletions map back to their
    /// `.wh.` marker files.
    pub fn archive_name(&self) -> String {
        match self.kind {
            EntryKind::Deletion(Deletion::Whiteout) => match self.path.rsplit_once('/') {
                Some((parent, name)) => format!("{}/{}{}", parent, WHITEOUT_PREFIX, name),
                None => format!("{}{}", WHITEOUT_PREFIX, self.path),
            },
            EntryKind::Deletion(Deletion::Opaque) => {
                if self.path.is_empty() {
                    OPAQUE_WHITEOUT.to_string()
                } else {
                    format!("{}/{}", self.path, OPAQUE_WHITEOUT)
                }
            }
            _ => self.path.clone(),
        }
    }
}

/// Normalize a raw member path.
///
/// Strips `strip_prefix` (members outside it yield `Ok(None)`), leading `/`
/// and `./`, `.` segments and trailing slashes. The archive root also yields
/// `Ok(None)`. Any `..` segment is rejected with `PathTraversal`.
pub fn normalize_path(raw: &str, strip_prefix: Option<&str>) -> Result<Option<String>> {
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(SquashError::PathTraversal(raw.to_string())),
            other => segments.push(other),
        }
    }

    if let Some(prefix) = strip_prefix {
        let prefix: Vec<&str> = prefix
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if segments.len() < prefix.len() || segments[..prefix.len()] != prefix[..] {
            return Ok(None);
        }
        segments.drain(..prefix.len());
    }

    if segments.is_empty() {
        return Ok(None);
    }

    Ok(Some(segments.join("/")))
}

/// Split a normalized path into a deletion marker, if it is one.
///
/// `a/.wh.b` → `(a/b, Whiteout)`, `a/.wh..wh..opq` → `(a, Opaque)`.
pub fn parse_deletion(path: &str) -> Option<(String, Deletion)> {
    let (parent, name) = match path.rsplit_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, path),
    };

    if name == OPAQUE_WHITEOUT {
        return Some((parent.unwrap_or("").to_string(), Deletion::Opaque));
    }

    let target = name.strip_prefix(WHITEOUT_PREFIX)?;
    if target.is_empty() {
        return None;
    }

    let full = match parent {
        Some(p) => format!("{}/{}", p, target),
        None => target.to_string(),
    };
    Some((full, Deletion::Whiteout))
}

/// Every proper ancestor of a normalized path, outermost first.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_leading_markers() {
        assert_eq!(normalize_path("./etc/passwd", None).unwrap().as_deref(), Some("etc/passwd"));
        assert_eq!(normalize_path("/etc/passwd", None).unwrap().as_deref(), Some("etc/passwd"));
        assert_eq!(normalize_path("etc/./ssl//certs/", None).unwrap().as_deref(), Some("etc/ssl/certs"));
    }

    #[test]
    fn test_normalize_root_is_none() {
        assert_eq!(normalize_path("./", None).unwrap(), None);
        assert_eq!(normalize_path("/", None).unwrap(), None);
        assert_eq!(normalize_path("", None).unwrap(), None);
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        let err = normalize_path("usr/../../etc/shadow", None).unwrap_err();
        assert!(matches!(err, SquashError::PathTraversal(_)));
        assert!(normalize_path("..", None).is_err());
    }

    #[test]
    fn test_normalize_keeps_dotted_names() {
        assert_eq!(normalize_path("a/..b/.c", None).unwrap().as_deref(), Some("a/..b/.c"));
    }

    #[test]
    fn test_normalize_strip_prefix() {
        assert_eq!(
            normalize_path("rootfs/usr/bin", Some("rootfs")).unwrap().as_deref(),
            Some("usr/bin")
        );
        assert_eq!(
            normalize_path("./rootfs/usr", Some("/rootfs/")).unwrap().as_deref(),
            Some("usr")
        );
        assert_eq!(normalize_path("rootfs", Some("rootfs")).unwrap(), None);
        assert_eq!(normalize_path("other/usr", Some("rootfs")).unwrap(), None);
        assert_eq!(normalize_path("rootfsx/usr", Some("rootfs")).unwrap(), None);
    }

    #[test]
    fn test_parse_deletion_whiteout() {
        assert_eq!(
            parse_deletion("etc/.wh.hosts"),
            Some(("etc/hosts".to_string(), Deletion::Whiteout))
        );
        assert_eq!(
            parse_deletion(".wh.a.txt"),
            Some(("a.txt".to_string(), Deletion::Whiteout))
        );
    }

    #[test]
    fn test_parse_deletion_opaque() {
        assert_eq!(
            parse_deletion("var/cache/.wh..wh..opq"),
            Some(("var/cache".to_string(), Deletion::Opaque))
        );
        assert_eq!(
            parse_deletion(".wh..wh..opq"),
            Some((String::new(), Deletion::Opaque))
        );
    }

    #[test]
    fn test_parse_deletion_regular_names() {
        assert_eq!(parse_deletion("etc/hosts"), None);
        assert_eq!(parse_deletion("etc/.whatever"), None);
        assert_eq!(parse_deletion("etc/.wh."), None);
    }

    #[test]
    fn test_archive_name_round_trips_markers() {
        let whiteout = Entry::whiteout("etc/hosts");
        assert_eq!(whiteout.archive_name(), "etc/.wh.hosts");
        assert_eq!(
            parse_deletion(&whiteout.archive_name()),
            Some(("etc/hosts".to_string(), Deletion::Whiteout))
        );

        assert_eq!(Entry::whiteout("a.txt").archive_name(), ".wh.a.txt");
        assert_eq!(Entry::opaque("var").archive_name(), "var/.wh..wh..opq");
        assert_eq!(Entry::opaque("").archive_name(), ".wh..wh..opq");
        assert_eq!(Entry::file("bin/sh", 0o755, 3).archive_name(), "bin/sh");
    }

    #[test]
    fn test_ancestors() {
        let all: Vec<&str> = ancestors("a/b/c").collect();
        assert_eq!(all, vec!["a", "a/b"]);
        assert_eq!(ancestors("top").count(), 0);
    }
}

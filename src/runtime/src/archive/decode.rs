//! Streaming layer decoder.
//!
//! Wraps `tar::Archive` and turns raw members into [`Entry`] values:
//! paths are normalized, whiteout marker files become deletion entries and
//! PAX xattrs are collected.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use squash_core::error::{Result, SquashError};

use super::entry::{normalize_path, parse_deletion, Entry, EntryKind};

const XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Decoder over a single layer archive.
///
/// The member sequence can be obtained once; layer streams are not
/// restartable.
pub struct LayerDecoder<R: Read> {
    archive: tar::Archive<R>,
    strip_prefix: Option<String>,
    started: bool,
}

impl<R: Read> LayerDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            archive: tar::Archive::new(reader),
            strip_prefix: None,
            started: false,
        }
    }

    /// Strip an archive-root prefix from every member path.
    pub fn with_strip_prefix(mut self, prefix: Option<String>) -> Self {
        self.strip_prefix = prefix;
        self
    }

    /// Lazily iterate the members in archive order.
    pub fn entries(&mut self) -> Result<Members<'_, R>> {
        if self.started {
            return Err(SquashError::MalformedArchive(
                "layer stream has already been consumed".to_string(),
            ));
        }
        self.started = true;

        let inner = self.archive.entries().map_err(malformed)?;
        Ok(Members {
            inner,
            strip_prefix: self.strip_prefix.as_deref(),
            failed: false,
        })
    }
}

/// Iterator over decoded members. Stops after the first error.
pub struct Members<'a, R: 'a + Read> {
    inner: tar::Entries<'a, R>,
    strip_prefix: Option<&'a str>,
    failed: bool,
}

impl<'a, R: 'a + Read> Iterator for Members<'a, R> {
    type Item = Result<Member<'a, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }

            let raw = match self.inner.next()? {
                Ok(raw) => raw,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(malformed(e)));
                }
            };

            match decode_member(raw, self.strip_prefix) {
                Ok(Some(member)) => return Some(Ok(member)),
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// A decoded member: its entry plus the not-yet-read body.
pub struct Member<'a, R: 'a + Read> {
    entry: Entry,
    body: tar::Entry<'a, R>,
}

impl<'a, R: 'a + Read> Member<'a, R> {
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn into_entry(self) -> Entry {
        self.entry
    }

    /// Copy the member body into `sink`, verifying the declared size.
    ///
    /// Returns the number of bytes copied; always zero for members other
    /// than regular files.
    pub fn copy_content(&mut self, sink: &mut dyn Write) -> Result<u64> {
        if self.entry.kind != EntryKind::RegularFile {
            return Ok(0);
        }

        let expected = self.entry.size;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied: u64 = 0;

        loop {
            let n = match self.body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(malformed(e)),
            };
            sink.write_all(&buf[..n])?;
            copied += n as u64;
        }

        if copied != expected {
            return Err(SquashError::TruncatedStream {
                path: self.entry.path.clone(),
                expected,
                actual: copied,
            });
        }

        Ok(copied)
    }
}

/// Decode a whole archive into memory. Meant for small archives and tests.
pub fn decode_all<R: Read>(reader: R) -> Result<Vec<(Entry, Vec<u8>)>> {
    let mut decoder = LayerDecoder::new(reader);
    let mut out = Vec::new();
    for member in decoder.entries()? {
        let mut member = member?;
        let mut content = Vec::new();
        member.copy_content(&mut content)?;
        out.push((member.into_entry(), content));
    }
    Ok(out)
}

fn decode_member<'a, R: Read>(
    mut raw: tar::Entry<'a, R>,
    strip_prefix: Option<&str>,
) -> Result<Option<Member<'a, R>>> {
    let header = raw.header();
    let entry_type = header.entry_type();

    if entry_type.is_pax_global_extensions() {
        return Ok(None);
    }

    let raw_path = utf8(&raw.path_bytes(), "member path")?;
    let mut path = match normalize_path(&raw_path, strip_prefix)? {
        Some(path) => path,
        None => {
            tracing::trace!(path = %raw_path, "Skipping member outside the layer root");
            return Ok(None);
        }
    };

    let mode = header.mode().map_err(malformed)? & 0o7777;
    let uid = numeric_or_zero(header.uid(), "uid", &raw_path);
    let gid = numeric_or_zero(header.gid(), "gid", &raw_path);
    let mtime = numeric_or_zero(header.mtime(), "mtime", &raw_path);
    let username = header.username().ok().flatten().filter(|s| !s.is_empty()).map(String::from);
    let groupname = header.groupname().ok().flatten().filter(|s| !s.is_empty()).map(String::from);
    let major = header.device_major().ok().flatten().unwrap_or(0);
    let minor = header.device_minor().ok().flatten().unwrap_or(0);

    let link_name = match raw.link_name_bytes() {
        Some(bytes) => Some(utf8(&bytes, "link name")?),
        None => None,
    };

    let kind = if let Some((target, deletion)) = parse_deletion(&path) {
        path = target;
        EntryKind::Deletion(deletion)
    } else if entry_type.is_file() || entry_type.is_contiguous() || entry_type.is_gnu_sparse() {
        EntryKind::RegularFile
    } else if entry_type.is_dir() {
        EntryKind::Directory
    } else if entry_type.is_symlink() {
        EntryKind::Symlink {
            target: link_name.unwrap_or_default(),
        }
    } else if entry_type.is_hard_link() {
        let raw_target = link_name.unwrap_or_default();
        let target = normalize_path(&raw_target, strip_prefix)?.ok_or_else(|| {
            SquashError::MalformedArchive(format!(
                "hardlink {} points outside the layer root: '{}'",
                path, raw_target
            ))
        })?;
        EntryKind::Hardlink { target }
    } else if entry_type.is_character_special() {
        EntryKind::CharDevice { major, minor }
    } else if entry_type.is_block_special() {
        EntryKind::BlockDevice { major, minor }
    } else if entry_type.is_fifo() {
        EntryKind::Fifo
    } else {
        return Err(SquashError::MalformedArchive(format!(
            "unsupported member type {:?} for {}",
            entry_type, path
        )));
    };

    let size = if kind == EntryKind::RegularFile {
        raw.size()
    } else {
        0
    };

    let mut xattrs = BTreeMap::new();
    if let Some(extensions) = raw.pax_extensions().map_err(malformed)? {
        for extension in extensions {
            let extension = extension.map_err(malformed)?;
            if let Some(name) = extension
                .key()
                .ok()
                .and_then(|key| key.strip_prefix(XATTR_PAX_PREFIX))
            {
                xattrs.insert(name.to_string(), extension.value_bytes().to_vec());
            }
        }
    }

    let entry = Entry {
        path,
        kind,
        mode,
        size,
        uid,
        gid,
        username,
        groupname,
        mtime,
        xattrs,
    };

    Ok(Some(Member { entry, body: raw }))
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|_| SquashError::MalformedArchive(format!("{} is not valid UTF-8", what)))
}

/// Blank or unparseable ownership and time fields read as zero.
fn numeric_or_zero(value: io::Result<u64>, field: &str, path: &str) -> u64 {
    value.unwrap_or_else(|e| {
        tracing::trace!(path, field, error = %e, "Unreadable numeric header field, using 0");
        0
    })
}

fn malformed(err: io::Error) -> SquashError {
    SquashError::MalformedArchive(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::entry::Deletion;
    use crate::archive::ArchiveEncoder;

    fn build(entries: &[(Entry, &[u8])]) -> Vec<u8> {
        let mut encoder = ArchiveEncoder::new(Vec::new());
        for (entry, content) in entries {
            let mut reader: &[u8] = content;
            encoder.append(entry, Some(&mut reader)).unwrap();
        }
        encoder.finish().unwrap()
    }

    fn raw_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, content: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
    }

    #[test]
    fn test_decode_files_and_dirs_in_order() {
        let bytes = build(&[
            (Entry::directory("etc", 0o755), b""),
            (Entry::file("etc/hostname", 0o644, 4), b"box\n"),
        ]);

        let decoded = decode_all(&bytes[..]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0.path, "etc");
        assert!(decoded[0].0.is_dir());
        assert_eq!(decoded[1].0.path, "etc/hostname");
        assert_eq!(decoded[1].0.mode, 0o644);
        assert_eq!(decoded[1].1, b"box\n");
    }

    #[test]
    fn test_decode_recognizes_whiteouts() {
        let mut builder = tar::Builder::new(Vec::new());
        raw_file(&mut builder, "etc/.wh.motd", b"");
        raw_file(&mut builder, "var/cache/.wh..wh..opq", b"");
        let bytes = builder.into_inner().unwrap();

        let decoded = decode_all(&bytes[..]).unwrap();
        assert_eq!(decoded[0].0.path, "etc/motd");
        assert_eq!(decoded[0].0.kind, EntryKind::Deletion(Deletion::Whiteout));
        assert_eq!((decoded[0].0.uid, decoded[0].0.gid, decoded[0].0.mtime), (0, 0, 0));
        assert_eq!(decoded[1].0.path, "var/cache");
        assert_eq!(decoded[1].0.kind, EntryKind::Deletion(Deletion::Opaque));
    }

    #[test]
    fn test_decode_strips_dot_slash_and_skips_root() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "./", &b""[..]).unwrap();
        raw_file(&mut builder, "./bin/sh", b"#!");
        let bytes = builder.into_inner().unwrap();

        let decoded = decode_all(&bytes[..]).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0.path, "bin/sh");
    }

    #[test]
    fn test_decode_strip_prefix_skips_outside_members() {
        let mut builder = tar::Builder::new(Vec::new());
        raw_file(&mut builder, "rootfs/app/main", b"bin");
        raw_file(&mut builder, "metadata.json", b"{}");
        let bytes = builder.into_inner().unwrap();

        let mut decoder = LayerDecoder::new(&bytes[..]).with_strip_prefix(Some("rootfs".to_string()));
        let paths: Vec<String> = decoder
            .entries()
            .unwrap()
            .map(|m| m.unwrap().into_entry().path)
            .collect();
        assert_eq!(paths, vec!["app/main".to_string()]);
    }

    #[test]
    fn test_decode_rejects_traversal() {
        let mut bytes = build(&[(Entry::file("aaaaaaaaaaaa", 0o644, 1), b"x")]);
        // Rewrite the stored name in place; "../etc/pass" has the same length.
        bytes[..12].copy_from_slice(b"../etc/passw");
        let mut header = tar::Header::from_byte_slice(&bytes[..512]).clone();
        header.set_cksum();
        bytes[..512].copy_from_slice(header.as_bytes());

        let err = decode_all(&bytes[..]).unwrap_err();
        assert!(matches!(err, SquashError::PathTraversal(_)));
    }

    #[test]
    fn test_decode_truncated_content() {
        let bytes = build(&[(Entry::file("big.bin", 0o644, 4096), &[7u8; 4096])]);
        // Header block plus a partial body.
        let truncated = &bytes[..512 + 1000];

        let err = decode_all(truncated).unwrap_err();
        match err {
            SquashError::TruncatedStream { path, expected, actual } => {
                assert_eq!(path, "big.bin");
                assert_eq!(expected, 4096);
                assert_eq!(actual, 1000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_garbage_header_is_malformed() {
        let garbage = vec![0xabu8; 1024];
        let err = decode_all(&garbage[..]).unwrap_err();
        assert!(matches!(err, SquashError::MalformedArchive(_)));
    }

    #[test]
    fn test_entries_is_not_restartable() {
        let bytes = build(&[(Entry::file("a", 0o644, 1), b"a")]);
        let mut decoder = LayerDecoder::new(&bytes[..]);
        let _ = decoder.entries().unwrap().count();
        assert!(matches!(
            decoder.entries(),
            Err(SquashError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_decode_preserves_special_members() {
        let mut symlink = Entry::new(
            "usr/bin/python",
            EntryKind::Symlink {
                target: "python3.12".to_string(),
            },
            0o777,
        );
        symlink.xattrs.insert("user.origin".to_string(), b"base".to_vec());
        let device = Entry::new("dev/null", EntryKind::CharDevice { major: 1, minor: 3 }, 0o666);
        let fifo = Entry::new("run/ctl", EntryKind::Fifo, 0o600);

        let bytes = build(&[(symlink.clone(), b""), (device.clone(), b""), (fifo.clone(), b"")]);
        let decoded = decode_all(&bytes[..]).unwrap();

        assert_eq!(decoded[0].0.kind, symlink.kind);
        assert_eq!(decoded[0].0.xattrs, symlink.xattrs);
        assert_eq!(decoded[1].0.kind, device.kind);
        assert_eq!(decoded[2].0.kind, EntryKind::Fifo);
    }

    #[test]
    fn test_decode_hardlink_target_is_normalized() {
        let mut builder = tar::Builder::new(Vec::new());
        raw_file(&mut builder, "./bin/busybox", b"elf");
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Link);
        header.set_size(0);
        header.set_mode(0o755);
        builder.append_link(&mut header, "./bin/ls", "./bin/busybox").unwrap();
        let bytes = builder.into_inner().unwrap();

        let decoded = decode_all(&bytes[..]).unwrap();
        assert_eq!(
            decoded[1].0.kind,
            EntryKind::Hardlink {
                target: "bin/busybox".to_string()
            }
        );
    }
}

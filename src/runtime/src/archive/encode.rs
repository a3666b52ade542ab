//! Archive encoder.

use std::io::{self, Read, Write};

use squash_core::error::{Result, SquashError};

use super::entry::{Entry, EntryKind};

/// Writes entries as tar members, in the order they are appended.
pub struct ArchiveEncoder<W: Write> {
    builder: tar::Builder<W>,
    appended: usize,
}

impl<W: Write> ArchiveEncoder<W> {
    pub fn new(sink: W) -> Self {
        Self {
            builder: tar::Builder::new(sink),
            appended: 0,
        }
    }

    /// Number of members written so far.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Append one entry. Regular files require `content` yielding exactly
    /// `entry.size` bytes; it is ignored for every other kind.
    pub fn append(&mut self, entry: &Entry, content: Option<&mut dyn Read>) -> Result<()> {
        if !entry.xattrs.is_empty() {
            let records: Vec<(String, &[u8])> = entry
                .xattrs
                .iter()
                .map(|(name, value)| (format!("SCHILY.xattr.{}", name), value.as_slice()))
                .collect();
            self.builder
                .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), *v)))?;
        }

        let name = entry.archive_name();
        let mut header = tar::Header::new_gnu();
        header.set_mode(entry.mode);
        header.set_uid(entry.uid);
        header.set_gid(entry.gid);
        header.set_mtime(entry.mtime);
        header.set_size(0);
        if let Some(username) = &entry.username {
            if header.set_username(username).is_err() {
                tracing::debug!(path = %entry.path, username = %username, "Dropping over-long user name");
            }
        }
        if let Some(groupname) = &entry.groupname {
            if header.set_groupname(groupname).is_err() {
                tracing::debug!(path = %entry.path, groupname = %groupname, "Dropping over-long group name");
            }
        }

        match &entry.kind {
            EntryKind::RegularFile => {
                let reader = content.ok_or_else(|| {
                    SquashError::Other(format!("No content supplied for {}", entry.path))
                })?;
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(entry.size);
                let body = ExactSize::new(reader, entry.size, &entry.path);
                self.builder.append_data(&mut header, &name, body)?;
            }
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                self.builder.append_data(&mut header, &name, io::empty())?;
            }
            EntryKind::Symlink { target } => {
                header.set_entry_type(tar::EntryType::Symlink);
                self.builder.append_link(&mut header, &name, target)?;
            }
            EntryKind::Hardlink { target } => {
                header.set_entry_type(tar::EntryType::Link);
                self.builder.append_link(&mut header, &name, target)?;
            }
            EntryKind::CharDevice { major, minor } => {
                header.set_entry_type(tar::EntryType::Char);
                header.set_device_major(*major)?;
                header.set_device_minor(*minor)?;
                self.builder.append_data(&mut header, &name, io::empty())?;
            }
            EntryKind::BlockDevice { major, minor } => {
                header.set_entry_type(tar::EntryType::Block);
                header.set_device_major(*major)?;
                header.set_device_minor(*minor)?;
                self.builder.append_data(&mut header, &name, io::empty())?;
            }
            EntryKind::Fifo => {
                header.set_entry_type(tar::EntryType::Fifo);
                self.builder.append_data(&mut header, &name, io::empty())?;
            }
            EntryKind::Deletion(_) => {
                header.set_entry_type(tar::EntryType::Regular);
                self.builder.append_data(&mut header, &name, io::empty())?;
            }
        }

        self.appended += 1;
        Ok(())
    }

    /// Write the end-of-archive trailer and return the sink.
    pub fn finish(self) -> Result<W> {
        let mut sink = self.builder.into_inner()?;
        sink.flush()?;
        Ok(sink)
    }
}

/// Encode a sequence of entries into `sink`.
pub fn encode<'a, W, I>(entries: I, sink: W) -> Result<W>
where
    W: Write,
    I: IntoIterator<Item = (Entry, Option<Box<dyn Read + 'a>>)>,
{
    let mut encoder = ArchiveEncoder::new(sink);
    for (entry, mut content) in entries {
        match content.as_mut() {
            Some(reader) => encoder.append(&entry, Some(reader.as_mut()))?,
            None => encoder.append(&entry, None)?,
        }
    }
    encoder.finish()
}

/// Reader that yields exactly `remaining` bytes or fails.
///
/// Keeps a short content source from producing a header/body mismatch.
struct ExactSize<'a, R: ?Sized> {
    inner: &'a mut R,
    remaining: u64,
    path: &'a str,
}

impl<'a, R: Read + ?Sized> ExactSize<'a, R> {
    fn new(inner: &'a mut R, size: u64, path: &'a str) -> Self {
        Self {
            inner,
            remaining: size,
            path,
        }
    }
}

impl<R: Read + ?Sized> Read for ExactSize<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} ended {} bytes early", self.path, self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::decode_all;

    #[test]
    fn test_empty_archive_has_trailer() {
        let encoder = ArchiveEncoder::new(Vec::new());
        let bytes = encoder.finish().unwrap();
        // Two zero blocks terminate a tar stream.
        assert_eq!(bytes.len(), 1024);
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(decode_all(&bytes[..]).unwrap().is_empty());
    }

    #[test]
    fn test_encode_preserves_input_order() {
        let entries = vec![
            (Entry::file("z.txt", 0o600, 1), Some(Box::new(&b"z"[..]) as Box<dyn Read>)),
            (Entry::directory("a", 0o700), None),
            (Entry::file("a/m.txt", 0o644, 2), Some(Box::new(&b"mm"[..]) as Box<dyn Read>)),
        ];
        let bytes = encode(entries, Vec::new()).unwrap();

        let decoded = decode_all(&bytes[..]).unwrap();
        let paths: Vec<&str> = decoded.iter().map(|(e, _)| e.path.as_str()).collect();
        assert_eq!(paths, vec!["z.txt", "a", "a/m.txt"]);
        assert_eq!(decoded[0].0.mode, 0o600);
        assert_eq!(decoded[2].1, b"mm");
    }

    #[test]
    fn test_encode_writes_deletion_markers() {
        let entries = vec![
            (Entry::whiteout("etc/motd"), None),
            (Entry::opaque("var/cache"), None),
        ];
        let bytes = encode(entries, Vec::new()).unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["etc/.wh.motd", "var/cache/.wh..wh..opq"]);
    }

    #[test]
    fn test_short_content_is_rejected() {
        let mut encoder = ArchiveEncoder::new(Vec::new());
        let mut short: &[u8] = b"abc";
        let err = encoder
            .append(&Entry::file("f", 0o644, 10), Some(&mut short))
            .unwrap_err();
        assert!(err.to_string().contains("ended 7 bytes early"));
    }

    #[test]
    fn test_regular_file_without_content_fails() {
        let mut encoder = ArchiveEncoder::new(Vec::new());
        assert!(encoder.append(&Entry::file("f", 0o644, 1), None).is_err());
    }

    #[test]
    fn test_ownership_and_mtime_survive() {
        let mut entry = Entry::file("srv/data", 0o640, 3);
        entry.uid = 1000;
        entry.gid = 100;
        entry.mtime = 1_700_000_000;
        entry.username = Some("app".to_string());
        entry.groupname = Some("users".to_string());

        let mut content: &[u8] = b"abc";
        let mut encoder = ArchiveEncoder::new(Vec::new());
        encoder.append(&entry, Some(&mut content)).unwrap();
        assert_eq!(encoder.appended(), 1);
        let bytes = encoder.finish().unwrap();

        let decoded = decode_all(&bytes[..]).unwrap();
        assert_eq!(decoded[0].0, entry);
    }
}

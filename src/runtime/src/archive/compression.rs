//! Layer compression detection and stream wrapping.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use squash_core::error::{Result, SquashError};
use squash_core::OutputCompression;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression wrapped around a layer tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
    Zstd,
}

impl LayerCompression {
    /// Detect compression from the first bytes of a blob.
    ///
    /// Anything that is neither gzip nor zstd is assumed to be a plain tar;
    /// the tar reader rejects it later if it is not.
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            LayerCompression::Gzip
        } else if head.starts_with(&ZSTD_MAGIC) {
            LayerCompression::Zstd
        } else {
            LayerCompression::None
        }
    }

    /// Detect compression of a file on disk.
    pub fn sniff_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut head = [0u8; 4];
        let mut filled = 0;
        while filled < head.len() {
            match file.read(&mut head[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(Self::sniff(&head[..filled]))
    }

    /// Wrap `reader` in the matching decompressor.
    pub fn open<R: Read + Send + 'static>(self, reader: R) -> Result<Box<dyn Read + Send>> {
        Ok(match self {
            LayerCompression::None => Box::new(reader),
            LayerCompression::Gzip => Box::new(GzDecoder::new(reader)),
            LayerCompression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader).map_err(
                |e| SquashError::MalformedArchive(format!("Invalid zstd stream: {}", e)),
            )?),
        })
    }
}

/// Writer for the published archive, optionally gzip-compressed.
pub enum OutputSink<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

impl<W: Write> OutputSink<W> {
    pub fn new(inner: W, compression: OutputCompression) -> Self {
        match compression {
            OutputCompression::None => OutputSink::Plain(inner),
            OutputCompression::Gzip => {
                OutputSink::Gzip(GzEncoder::new(inner, Compression::default()))
            }
        }
    }

    /// Flush any compressor trailer and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            OutputSink::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            OutputSink::Gzip(encoder) => {
                let mut w = encoder.finish()?;
                w.flush()?;
                Ok(w)
            }
        }
    }
}

impl<W: Write> Write for OutputSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputSink::Plain(w) => w.write(buf),
            OutputSink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Plain(w) => w.flush(),
            OutputSink::Gzip(w) => w.flush(),
        }
    }
}

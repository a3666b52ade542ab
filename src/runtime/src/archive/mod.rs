//! Layer archive codec.
//!
//! Reads and writes the layer tar format: regular files, directories,
//! symlinks, hardlinks, devices, FIFOs and `.wh.` deletion markers.
//! Compressed layers (gzip, zstd) are unwrapped by [`LayerCompression`]
//! before they reach the decoder.

mod compression;
mod decode;
mod encode;
mod entry;

pub use compression::{LayerCompression, OutputSink};
pub use decode::{decode_all, LayerDecoder, Member, Members};
pub use encode::{encode, ArchiveEncoder};
pub use entry::{
    ancestors, normalize_path, parse_deletion, Deletion, Entry, EntryKind,
    IMPLIED_DIR_MODE, OPAQUE_WHITEOUT, WHITEOUT_PREFIX,
};

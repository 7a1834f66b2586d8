//! For reading and writing forensic disk images in the Expert Witness
//! Compression Format (EWF), better known by its `.E01` file extension.
//!
//! An EWF image splits the source medium into fixed-size *chunks*, each
//! optionally compressed, spread over a numbered sequence of *segment files*
//! (`.E01`, `.E02`, …). A chunk table inside each segment file maps chunk
//! indices to byte offsets. This crate implements the chunk I/O engine:
//! resolving a logical offset to a chunk payload across segment files,
//! packing and unpacking chunk data (empty-block detection, 64-bit pattern
//! fill, deflate or bzip2, Adler-32 trailers), caching chunk groups and
//! chunks, overlaying delta chunks written after acquisition, and recording
//! checksum errors as sector ranges for forensic reporting.
//!
//! [`ChunkTable`] is the main entry point for reads; [`SegmentWriter`]
//! produces segment file content during acquisition.

pub mod cache;
pub mod checksum;
pub mod chunk;
pub mod compression;
pub mod files;
pub mod lazy;
pub mod media;
pub mod pool;
pub mod segment;
pub mod table;
pub mod writer;

pub use cache::{Cache, CacheKey};
pub use checksum::{adler32, Adler32};
pub use chunk::{ChunkData, PackFlags, RangeFlags};
pub use compression::{CompressionFlags, CompressionLevel, CompressionMethod};
pub use files::{segment_extension, segment_filename, SegmentFileLoader};
pub use lazy::{DataDescriptor, DataList, ElementReader, RangeList};
pub use media::{IoHandle, MediaValues};
pub use pool::FileIoPool;
pub use segment::{ChunkGroupDescriptor, SegmentFile, SegmentTable};
pub use table::ChunkTable;
pub use writer::SegmentWriter;

#[cfg(test)]
mod test;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// A caller-supplied value was rejected before any I/O happened.
    InvalidInput(&'static str),
    /// The image itself is damaged: a checksum mismatch on a chunk table, a
    /// table offset pointing outside its segment file, or a malformed
    /// section. Chunk *payload* corruption is not reported this way; it is
    /// absorbed into [`RangeFlags::IS_CORRUPTED`] and the checksum-error
    /// list instead.
    Corrupt(String),
    UnknownCompression(u16),
    /// The requested offset lies at or past the end of the media.
    OutOfBounds(u64),
    /// The file I/O pool could not free up an open file handle.
    PoolExhausted,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => f.write_fmt(format_args!("io error: {e}")),
            Error::InvalidInput(what) => f.write_fmt(format_args!("invalid input: {what}")),
            Error::Corrupt(what) => f.write_fmt(format_args!("corrupt image: {what}")),
            Error::UnknownCompression(method) => f.write_fmt(format_args!(
                "compression method ({method}) was not recognised"
            )),
            Error::OutOfBounds(offset) => {
                f.write_fmt(format_args!("offset {offset} is past the end of the media"))
            }
            Error::PoolExhausted => f.write_str("file io pool has no handle to spare"),
        }
    }
}

impl std::error::Error for Error {}

//! Compression methods recognised by the chunk engine, plus the two
//! detectors that let the packer avoid compressing at all: the empty-block
//! check and the 64-bit pattern-fill check.

use std::convert::TryFrom;
use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use num_enum::TryFromPrimitive;

use crate::{Error, Result};

/// How chunk payloads are compressed within the image. The discriminants
/// match the on-disk numbering used by EWF version 2 headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum CompressionMethod {
    None = 0,
    Deflate = 1,
    Bzip2 = 2,
}

/// Compression effort, as stored in the image header. `None` means chunks
/// are stored raw unless a write forces compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CompressionLevel {
    None = 0,
    Fast = 1,
    Best = 2,
}

bitflags! {
    /// Image-wide compression behaviour selected at handle open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompressionFlags: u8 {
        /// Replace zero-filled chunks with the precomputed empty-block blob.
        const USE_EMPTY_BLOCK_COMPRESSION = 0x01;
        /// Store chunks that repeat one 8-byte pattern as a 16-byte record.
        const USE_PATTERN_FILL_COMPRESSION = 0x02;
    }
}

impl CompressionMethod {
    pub fn from_wire(value: u16) -> Result<Self> {
        CompressionMethod::try_from(value).map_err(|_| Error::UnknownCompression(value))
    }
}

impl CompressionLevel {
    fn deflate(self) -> flate2::Compression {
        match self {
            CompressionLevel::None => flate2::Compression::none(),
            CompressionLevel::Fast => flate2::Compression::fast(),
            CompressionLevel::Best => flate2::Compression::best(),
        }
    }

    fn bzip2(self) -> bzip2::Compression {
        match self {
            CompressionLevel::None | CompressionLevel::Fast => bzip2::Compression::new(1),
            CompressionLevel::Best => bzip2::Compression::new(9),
        }
    }
}

/// Compress `data` with the given method. Deflate output is a zlib stream,
/// which is what EWF stores for compressed chunks. The caller compares the
/// returned length against the uncompressed size to decide whether the
/// compressed form is worth keeping.
pub fn compress(method: CompressionMethod, level: CompressionLevel, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Err(Error::InvalidInput(
            "cannot compress without a compression method",
        )),
        CompressionMethod::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level.deflate());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionMethod::Bzip2 => {
            let mut encoder = BzEncoder::new(Vec::with_capacity(data.len() / 2), level.bzip2());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decompress a chunk payload. `expected_size` bounds the output so a
/// damaged stream cannot balloon memory; producing more than that is
/// reported as corruption, as is any decoder failure.
pub fn decompress(
    method: CompressionMethod,
    data: &[u8],
    expected_size: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_size);
    let limit = expected_size as u64 + 1;
    let read = match method {
        CompressionMethod::None => {
            return Err(Error::InvalidInput(
                "cannot decompress without a compression method",
            ))
        }
        CompressionMethod::Deflate => ZlibDecoder::new(data).take(limit).read_to_end(&mut out),
        CompressionMethod::Bzip2 => BzDecoder::new(data).take(limit).read_to_end(&mut out),
    };

    match read {
        Ok(n) if n > expected_size => Err(Error::Corrupt(format!(
            "chunk decompressed past its expected size of {expected_size} bytes"
        ))),
        Ok(_) => Ok(out),
        Err(e) => Err(Error::Corrupt(format!("chunk failed to decompress: {e}"))),
    }
}

/// True iff every byte equals the first byte and that byte is zero. Bails
/// on the first mismatch, so runs of real data cost almost nothing.
pub fn is_empty_block(data: &[u8]) -> bool {
    match data.first() {
        Some(0) => data.iter().all(|&b| b == 0),
        _ => false,
    }
}

/// Check whether `data` is an integer repetition of one 8-byte pattern.
/// Requires at least 16 bytes and a multiple of 8; returns the pattern read
/// little-endian from the first word. An all-zero chunk satisfies this too,
/// but the packer prefers the empty-block form for those.
pub fn find_pattern_fill(data: &[u8]) -> Option<u64> {
    if data.len() < 16 || data.len() % 8 != 0 {
        return None;
    }

    let first = &data[..8];
    let mut words = data.chunks_exact(8);
    words.next();

    if words.all(|word| word == first) {
        Some(LittleEndian::read_u64(first))
    } else {
        None
    }
}

//! Immutable per-handle configuration: the geometry of the acquired medium
//! and the I/O policies chosen when the handle was opened.

use once_cell::sync::OnceCell;

use crate::chunk::PackFlags;
use crate::compression::{compress, CompressionFlags, CompressionLevel, CompressionMethod};
use crate::{Error, Result};

/// Geometry of the acquired medium. Fixed once an image is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaValues {
    /// Bytes per chunk; a power of two, typically 32 KiB.
    pub chunk_size: u32,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    pub number_of_sectors: u64,
    pub media_size: u64,
}

impl MediaValues {
    pub fn new(
        sectors_per_chunk: u32,
        bytes_per_sector: u32,
        number_of_sectors: u64,
    ) -> Result<Self> {
        if sectors_per_chunk == 0 || bytes_per_sector == 0 {
            return Err(Error::InvalidInput("media geometry values must be non-zero"));
        }
        let chunk_size = sectors_per_chunk
            .checked_mul(bytes_per_sector)
            .ok_or(Error::InvalidInput("chunk size overflows 32 bits"))?;
        if !chunk_size.is_power_of_two() {
            return Err(Error::InvalidInput("chunk size must be a power of two"));
        }
        Ok(MediaValues {
            chunk_size,
            sectors_per_chunk,
            bytes_per_sector,
            number_of_sectors,
            media_size: number_of_sectors * u64::from(bytes_per_sector),
        })
    }

    /// Geometry for a media size that is not a whole number of sectors,
    /// as some acquisition tools record. The sector count rounds up so
    /// every byte belongs to a sector.
    pub fn with_media_size(
        sectors_per_chunk: u32,
        bytes_per_sector: u32,
        media_size: u64,
    ) -> Result<Self> {
        let number_of_sectors = media_size.div_ceil(u64::from(bytes_per_sector.max(1)));
        let mut media = Self::new(sectors_per_chunk, bytes_per_sector, number_of_sectors)?;
        media.media_size = media_size;
        Ok(media)
    }

    /// Number of chunks needed to cover the media, tail included.
    pub fn chunk_count(&self) -> u64 {
        self.media_size.div_ceil(u64::from(self.chunk_size))
    }

    /// The unpacked size of a given chunk: the nominal chunk size, except
    /// for a tail chunk cut short by the media end.
    pub fn chunk_logical_size(&self, chunk_index: u64) -> usize {
        let start = chunk_index * u64::from(self.chunk_size);
        let remaining = self.media_size.saturating_sub(start);
        remaining.min(u64::from(self.chunk_size)) as usize
    }
}

/// I/O policy shared by every operation on a handle. Immutable after open;
/// clones for concurrent readers share one instance.
#[derive(Debug)]
pub struct IoHandle {
    pub compression_method: CompressionMethod,
    pub compression_level: CompressionLevel,
    pub compression_flags: CompressionFlags,
    /// Return zeroed payloads for chunks that fail checksum verification.
    pub zero_on_error: bool,
    empty_block: OnceCell<Vec<u8>>,
}

impl IoHandle {
    pub fn new(
        compression_method: CompressionMethod,
        compression_level: CompressionLevel,
        compression_flags: CompressionFlags,
        zero_on_error: bool,
    ) -> Self {
        IoHandle {
            compression_method,
            compression_level,
            compression_flags,
            zero_on_error,
            empty_block: OnceCell::new(),
        }
    }

    /// The pack flags implied by this handle's compression flags.
    pub fn pack_flags(&self) -> PackFlags {
        let mut flags = PackFlags::USE_COMPRESSION_IF_SMALLER;
        if self
            .compression_flags
            .contains(CompressionFlags::USE_PATTERN_FILL_COMPRESSION)
        {
            flags |= PackFlags::USE_PATTERN_FILL;
        }
        flags
    }

    /// The canonical compressed form of a zero-filled chunk, computed on
    /// first use. `None` when empty-block compression is off or no
    /// compression method is configured.
    pub fn empty_block_blob(&self, chunk_size: u32) -> Result<Option<&[u8]>> {
        if self.compression_method == CompressionMethod::None
            || !self
                .compression_flags
                .contains(CompressionFlags::USE_EMPTY_BLOCK_COMPRESSION)
        {
            return Ok(None);
        }
        let level = match self.compression_level {
            CompressionLevel::None => CompressionLevel::Fast,
            other => other,
        };
        let blob = self.empty_block.get_or_try_init(|| {
            compress(
                self.compression_method,
                level,
                &vec![0u8; chunk_size as usize],
            )
        })?;
        Ok(Some(blob.as_slice()))
    }
}

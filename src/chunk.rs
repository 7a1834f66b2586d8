//! Chunk payloads and the pack/unpack state machine that converts between
//! raw media bytes and the on-disk chunk forms: uncompressed with an
//! Adler-32 trailer, deflate/bzip2 streams, the precomputed empty-block
//! blob, and 16-byte pattern-fill records.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::checksum::adler32;
use crate::compression::{
    compress, decompress, find_pattern_fill, is_empty_block, CompressionLevel, CompressionMethod,
};
use crate::{Error, Result};

/// Bytes of the Adler-32 trailer on an uncompressed chunk.
pub const CHECKSUM_SIZE: usize = 4;

/// A pattern-fill record is the 8-byte pattern followed by an 8-byte
/// little-endian repeat count.
pub const PATTERN_FILL_RECORD_SIZE: usize = 16;

/// Alignment boundary applied by [`PackFlags::PAD`].
const PAD_ALIGNMENT: usize = 16;

bitflags! {
    /// Flags describing the state and stored form of a chunk. The lower
    /// bits travel with chunk descriptors in group tables; the rest are
    /// maintained by the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RangeFlags: u32 {
        /// The stored payload is a deflate/bzip2 stream.
        const COMPRESSED = 0x0000_0001;
        /// The chunk currently holds its on-disk form. Cleared by unpack.
        const PACKED = 0x0000_0002;
        /// Checksum or decompression failure. Terminal for the chunk: a
        /// repeated read returns the same state without touching disk.
        const IS_CORRUPTED = 0x0000_0004;
        /// The chunk was rewritten after acquisition and lives in the
        /// delta overlay rather than the primary chunk stream.
        const IS_DELTA = 0x0000_0008;
        /// No payload is stored; the chunk reads as zeros.
        const IS_SPARSE = 0x0000_0010;
        /// The stored payload is a 16-byte pattern-fill record, or the
        /// canonical empty-block blob when `COMPRESSED` is also set.
        const USES_PATTERN_FILL = 0x0000_0020;
        /// A primary chunk replaced in memory before being persisted.
        const TAINTED = 0x0000_0040;
    }
}

bitflags! {
    /// Per-write packing behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PackFlags: u8 {
        /// Keep the compressed form even when it is larger than the data.
        const FORCE_COMPRESSION = 0x01;
        /// Attempt compression even at level `None`, keeping it only when
        /// it beats the uncompressed form.
        const USE_COMPRESSION_IF_SMALLER = 0x02;
        /// Store chunks repeating one 8-byte pattern as 16-byte records.
        const USE_PATTERN_FILL = 0x04;
        /// Pad packed uncompressed chunks to a 16-byte boundary.
        const PAD = 0x08;
    }
}

/// One chunk of the media, in whichever representation it currently has.
///
/// `data` holds raw media bytes; when the chunk is packed uncompressed, the
/// Adler-32 trailer and any alignment padding sit in the same buffer past
/// `data_size`. `compressed_data` holds the alternate stored form when one
/// exists, with the payload starting at `compressed_data_offset`.
#[derive(Debug, Clone, Default)]
pub struct ChunkData {
    data: Vec<u8>,
    data_size: usize,
    compressed_data: Option<Vec<u8>>,
    compressed_data_offset: usize,
    padding_size: usize,
    range_flags: RangeFlags,
    checksum: u32,
}

impl ChunkData {
    /// An unpacked chunk holding raw media bytes, ready to pack.
    pub fn new(data: Vec<u8>) -> Self {
        let data_size = data.len();
        ChunkData {
            data,
            data_size,
            ..Default::default()
        }
    }

    /// An unpacked, zero-filled chunk.
    pub fn zeroed(size: usize) -> Self {
        Self::new(vec![0; size])
    }

    /// A raw chunk destined for the delta overlay.
    pub fn delta(data: Vec<u8>) -> Self {
        let mut chunk = Self::new(data);
        chunk.range_flags.insert(RangeFlags::IS_DELTA);
        chunk
    }

    /// A zeroed stand-in for a chunk the recorded tables have no entry
    /// for. A hole in the chunk table means acquisition lost the chunk,
    /// so the stand-in is flagged corrupted from the start.
    pub fn missing(size: usize) -> Self {
        let mut chunk = Self::zeroed(size);
        chunk.range_flags.insert(RangeFlags::IS_CORRUPTED);
        chunk
    }

    /// A chunk as loaded from a segment file: `stored` is the on-disk
    /// payload and `flags` come from the chunk's group descriptor.
    pub fn from_stored(stored: Vec<u8>, flags: RangeFlags) -> Self {
        let mut chunk = ChunkData {
            range_flags: flags | RangeFlags::PACKED,
            ..Default::default()
        };
        if flags.intersects(RangeFlags::COMPRESSED | RangeFlags::USES_PATTERN_FILL) {
            chunk.compressed_data = Some(stored);
        } else {
            chunk.data_size = stored.len();
            chunk.data = stored;
        }
        chunk
    }

    /// The raw media bytes. Valid once the chunk is unpacked; for a packed
    /// uncompressed chunk this still excludes trailer and padding.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_size]
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn range_flags(&self) -> RangeFlags {
        self.range_flags
    }

    pub fn is_packed(&self) -> bool {
        self.range_flags.contains(RangeFlags::PACKED)
    }

    pub fn is_corrupted(&self) -> bool {
        self.range_flags.contains(RangeFlags::IS_CORRUPTED)
    }

    /// Adler-32 of the raw data, set when packing or verified when
    /// unpacking an uncompressed chunk.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn padding_size(&self) -> usize {
        self.padding_size
    }

    /// Mark a chunk replaced in memory before it was persisted.
    pub fn taint(&mut self) {
        self.range_flags.insert(RangeFlags::TAINTED);
    }

    /// The stored payload, if this chunk carries one.
    fn stored_payload(&self) -> Option<&[u8]> {
        self.compressed_data
            .as_ref()
            .map(|stored| &stored[self.compressed_data_offset..])
    }

    /// Bytes this chunk occupies on disk in its packed form.
    pub fn write_size(&self) -> Result<usize> {
        if !self.is_packed() {
            return Err(Error::InvalidInput("chunk is not packed"));
        }
        match self.stored_payload() {
            Some(stored) => Ok(stored.len()),
            None => Ok(self.data_size + CHECKSUM_SIZE + self.padding_size),
        }
    }

    /// The exact bytes to append to a segment file.
    pub fn packed_bytes(&self) -> Result<&[u8]> {
        if !self.is_packed() {
            return Err(Error::InvalidInput("chunk is not packed"));
        }
        match self.stored_payload() {
            Some(stored) => Ok(stored),
            None => Ok(&self.data[..self.data_size + CHECKSUM_SIZE + self.padding_size]),
        }
    }

    /// Overwrite the raw data with `size` zero bytes, keeping the flags.
    /// Used for `zero_on_error` handling of corrupted chunks.
    pub fn zero(&mut self, size: usize) {
        self.data.clear();
        self.data.resize(size, 0);
        self.data_size = size;
    }

    /// Transform raw data toward its on-disk form. First match wins:
    ///
    /// 1. zero-filled chunk and `empty_block_blob` supplied: reuse the blob;
    /// 2. `USE_PATTERN_FILL` and the data repeats one 8-byte word: 16-byte
    ///    pattern record;
    /// 3. compression requested: keep the compressed stream if it is
    ///    smaller than the data plus trailer, or unconditionally under
    ///    `FORCE_COMPRESSION`;
    /// 4. otherwise append the Adler-32 trailer, plus alignment padding
    ///    under `PAD`.
    ///
    /// Packing an already packed chunk is a no-op.
    pub fn pack(
        &mut self,
        chunk_size: u32,
        method: CompressionMethod,
        level: CompressionLevel,
        empty_block_blob: Option<&[u8]>,
        pack_flags: PackFlags,
    ) -> Result<()> {
        if self.is_packed() {
            return Ok(());
        }
        let data_size = self.data_size;
        if data_size == 0 {
            return Err(Error::InvalidInput("cannot pack an empty chunk"));
        }
        if data_size > chunk_size as usize {
            return Err(Error::InvalidInput("chunk data exceeds the chunk size"));
        }

        let force = pack_flags.contains(PackFlags::FORCE_COMPRESSION);
        let full_chunk = data_size == chunk_size as usize;

        if !force && full_chunk && is_empty_block(self.data()) {
            if let Some(blob) = empty_block_blob {
                self.compressed_data = Some(blob.to_vec());
                self.compressed_data_offset = 0;
                self.range_flags.insert(
                    RangeFlags::COMPRESSED | RangeFlags::USES_PATTERN_FILL | RangeFlags::PACKED,
                );
                return Ok(());
            }
        }

        if !force && pack_flags.contains(PackFlags::USE_PATTERN_FILL) {
            if let Some(pattern) = find_pattern_fill(self.data()) {
                let mut record = Vec::with_capacity(PATTERN_FILL_RECORD_SIZE);
                record.write_u64::<LittleEndian>(pattern)?;
                record.write_u64::<LittleEndian>((data_size / 8) as u64)?;
                self.compressed_data = Some(record);
                self.compressed_data_offset = 0;
                self.range_flags
                    .insert(RangeFlags::USES_PATTERN_FILL | RangeFlags::PACKED);
                return Ok(());
            }
        }

        let try_compression = method != CompressionMethod::None
            && (level != CompressionLevel::None
                || force
                || pack_flags.contains(PackFlags::USE_COMPRESSION_IF_SMALLER));

        if try_compression {
            let level = match level {
                CompressionLevel::None => CompressionLevel::Fast,
                other => other,
            };
            let packed = compress(method, level, self.data())?;
            if force || packed.len() < data_size + CHECKSUM_SIZE {
                self.compressed_data = Some(packed);
                self.compressed_data_offset = 0;
                self.range_flags
                    .insert(RangeFlags::COMPRESSED | RangeFlags::PACKED);
                return Ok(());
            }
        }

        let checksum = adler32(self.data());
        self.checksum = checksum;
        self.data.truncate(data_size);
        self.data.write_u32::<LittleEndian>(checksum)?;
        self.padding_size = 0;
        if pack_flags.contains(PackFlags::PAD) {
            let unaligned = (data_size + CHECKSUM_SIZE) % PAD_ALIGNMENT;
            if unaligned != 0 {
                self.padding_size = PAD_ALIGNMENT - unaligned;
                self.data
                    .resize(data_size + CHECKSUM_SIZE + self.padding_size, 0);
            }
        }
        self.range_flags.insert(RangeFlags::PACKED);
        Ok(())
    }

    /// Restore raw media bytes from the packed form. `chunk_size` is the
    /// expected unpacked size of this particular chunk, which for the tail
    /// chunk of an image is smaller than the nominal chunk size.
    ///
    /// Payload damage is not an error: the chunk is flagged
    /// [`RangeFlags::IS_CORRUPTED`] and kept as received. Unpacking an
    /// unpacked or corrupted chunk is a no-op.
    pub fn unpack(&mut self, chunk_size: usize, method: CompressionMethod) -> Result<()> {
        if self.is_corrupted() || !self.is_packed() {
            return Ok(());
        }

        if self.range_flags.contains(RangeFlags::IS_SPARSE) {
            self.data.clear();
            self.data.resize(chunk_size, 0);
            self.data_size = chunk_size;
            self.compressed_data = None;
            self.range_flags
                .remove(RangeFlags::PACKED | RangeFlags::COMPRESSED);
            return Ok(());
        }

        if self.range_flags.contains(RangeFlags::USES_PATTERN_FILL) {
            // The empty-block blob carries USES_PATTERN_FILL too but is a
            // zlib stream; only a 16-byte payload is a pattern record.
            let record = match self.stored_payload() {
                Some(stored) if stored.len() == PATTERN_FILL_RECORD_SIZE => Some(stored),
                _ => None,
            };
            if let Some(record) = record {
                let pattern = LittleEndian::read_u64(&record[..8]);
                let count = LittleEndian::read_u64(&record[8..16]) as usize;
                if count.checked_mul(8) != Some(chunk_size) {
                    self.range_flags.insert(RangeFlags::IS_CORRUPTED);
                    return Ok(());
                }
                let mut data = Vec::with_capacity(chunk_size);
                for _ in 0..count {
                    data.extend_from_slice(&pattern.to_le_bytes());
                }
                self.data = data;
                self.data_size = chunk_size;
                self.range_flags
                    .remove(RangeFlags::PACKED | RangeFlags::COMPRESSED);
                return Ok(());
            }
        }

        if self.range_flags.contains(RangeFlags::COMPRESSED) {
            let stored = match self.stored_payload() {
                Some(stored) if !stored.is_empty() => stored,
                _ => {
                    self.range_flags.insert(RangeFlags::IS_CORRUPTED);
                    return Ok(());
                }
            };
            match decompress(method, stored, chunk_size) {
                Ok(data) if data.len() == chunk_size => {
                    self.data_size = data.len();
                    self.data = data;
                    self.range_flags.remove(RangeFlags::PACKED);
                }
                Ok(_) | Err(Error::Corrupt(_)) => {
                    self.range_flags.insert(RangeFlags::IS_CORRUPTED);
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        // Uncompressed: payload, 4-byte Adler-32, then optional padding.
        let total = self.data.len();
        if total < CHECKSUM_SIZE + self.padding_size {
            self.range_flags.insert(RangeFlags::IS_CORRUPTED);
            return Ok(());
        }
        let payload = total - CHECKSUM_SIZE - self.padding_size;
        if payload != chunk_size {
            self.range_flags.insert(RangeFlags::IS_CORRUPTED);
            return Ok(());
        }
        let stored_sum = LittleEndian::read_u32(&self.data[payload..payload + CHECKSUM_SIZE]);
        if adler32(&self.data[..payload]) != stored_sum {
            self.range_flags.insert(RangeFlags::IS_CORRUPTED);
            return Ok(());
        }
        self.checksum = stored_sum;
        self.data_size = payload;
        self.data.truncate(payload);
        self.range_flags.remove(RangeFlags::PACKED);
        Ok(())
    }
}

//! The primary write path: pack chunks, append their payloads to a
//! segment file, and emit the `table`/`table2` sections describing them.

use std::io::{Seek, Write};
use std::sync::Arc;

use bit_field::BitField;

use crate::checksum::adler32;
use crate::chunk::{ChunkData, PackFlags, RangeFlags};
use crate::media::{IoHandle, MediaValues};
use crate::segment::{ChunkGroupDescriptor, SegmentFile, COMPRESSED_BIT, MAX_TABLE_ENTRIES};
use crate::{Error, Result};

/// Writes one segment file during acquisition. Chunks are packed with the
/// handle's compression settings, appended in order, and described by a
/// `table` section plus its redundant `table2` copy per chunk group. A new
/// group starts when a table fills up or a payload offset no longer fits
/// the 31 bits of a table entry.
///
/// Writing is strictly sequential; only the final chunk of the image may
/// be shorter than the chunk size.
#[derive(Debug)]
pub struct SegmentWriter<S> {
    io: S,
    io_handle: Arc<IoHandle>,
    media: Arc<MediaValues>,
    segment_number: u32,
    start_offset: u64,
    position: u64,
    base_offset: u64,
    entries: Vec<u32>,
    group_logical_start: u64,
    logical_written: u64,
    groups: Vec<ChunkGroupDescriptor>,
    tail_written: bool,
}

impl<S: Write + Seek> SegmentWriter<S> {
    /// Begin a segment file. `start_offset` is the logical image offset
    /// of the first chunk this segment will hold; payloads are written
    /// from the stream's current position.
    pub fn new(
        mut io: S,
        io_handle: Arc<IoHandle>,
        media: Arc<MediaValues>,
        segment_number: u32,
        start_offset: u64,
    ) -> Result<Self> {
        if segment_number == 0 {
            return Err(Error::InvalidInput("segment numbers start at one"));
        }
        let position = io.stream_position()?;
        Ok(SegmentWriter {
            io,
            io_handle,
            media,
            segment_number,
            start_offset,
            position,
            base_offset: position,
            entries: Vec::new(),
            group_logical_start: 0,
            logical_written: 0,
            groups: Vec::new(),
            tail_written: false,
        })
    }

    /// Logical media bytes written to this segment so far.
    pub fn logical_written(&self) -> u64 {
        self.logical_written
    }

    /// Pack and append one chunk of raw media bytes.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if self.tail_written {
            return Err(Error::InvalidInput(
                "no chunk may follow a short tail chunk",
            ));
        }
        let chunk_size = self.media.chunk_size;
        if data.len() > chunk_size as usize {
            return Err(Error::InvalidInput("chunk data exceeds the chunk size"));
        }
        if data.len() < chunk_size as usize {
            self.tail_written = true;
        }

        let mut chunk = ChunkData::new(data.to_vec());
        let blob = self.io_handle.empty_block_blob(chunk_size)?;
        // a v1 table entry cannot flag pattern fill, so never pack with it
        let pack_flags = self.io_handle.pack_flags() - PackFlags::USE_PATTERN_FILL;
        chunk.pack(
            chunk_size,
            self.io_handle.compression_method,
            self.io_handle.compression_level,
            blob,
            pack_flags,
        )?;

        if self.entries.len() as u32 >= MAX_TABLE_ENTRIES
            || self.position - self.base_offset > i32::MAX as u64
        {
            self.flush_group()?;
        }
        if self.entries.is_empty() {
            self.base_offset = self.position;
        }

        let mut entry = (self.position - self.base_offset) as u32;
        entry.set_bit(
            COMPRESSED_BIT,
            chunk.range_flags().contains(RangeFlags::COMPRESSED),
        );
        self.entries.push(entry);

        let packed = chunk.packed_bytes()?;
        self.io.write_all(packed)?;
        self.position += packed.len() as u64;
        self.logical_written += data.len() as u64;
        Ok(())
    }

    /// Close the current chunk group by writing its `table` and `table2`
    /// sections. A no-op when no chunks are pending.
    pub fn flush_group(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let sectors_end = self.position;
        let section = table_section_bytes(self.base_offset, &self.entries);

        let table_offset = self.position;
        self.io.write_all(&section)?;
        let table2_offset = table_offset + section.len() as u64;
        self.io.write_all(&section)?;
        self.position = table2_offset + section.len() as u64;

        self.groups.push(ChunkGroupDescriptor {
            data_offset: self.group_logical_start,
            data_size: self.logical_written - self.group_logical_start,
            number_of_chunks: self.entries.len() as u32,
            table_offset,
            table2_offset: Some(table2_offset),
            sectors_end,
        });
        self.entries.clear();
        self.group_logical_start = self.logical_written;
        self.base_offset = self.position;
        Ok(())
    }

    /// Flush any pending group and hand back the segment file metadata
    /// needed to reopen the image, along with the underlying stream.
    /// `pool_entry` is where the caller registers this file in its I/O
    /// pool.
    pub fn finish(mut self, pool_entry: usize) -> Result<(SegmentFile, S)> {
        self.flush_group()?;
        let mut segment = SegmentFile::new(
            self.segment_number,
            self.start_offset,
            self.logical_written,
            pool_entry,
        );
        for group in self.groups {
            segment.add_chunk_group(group)?;
        }
        Ok((segment, self.io))
    }
}

/// Serialize a `table` section: checksummed header, entries, entries
/// checksum.
fn table_section_bytes(base_offset: u64, entries: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + entries.len() * 4 + 4);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&base_offset.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    let header_checksum = adler32(&out);
    out.extend_from_slice(&header_checksum.to_le_bytes());

    let mut raw_entries = Vec::with_capacity(entries.len() * 4);
    for &entry in entries {
        raw_entries.extend_from_slice(&entry.to_le_bytes());
    }
    let entries_checksum = adler32(&raw_entries);
    out.extend_from_slice(&raw_entries);
    out.extend_from_slice(&entries_checksum.to_le_bytes());
    out
}

//! Segment files and the chunk tables inside them.
//!
//! A segment file covers a contiguous extent of the logical image and
//! holds one or more chunk groups, each described on disk by a `table`
//! section (with a redundant `table2` copy). Resolving a logical offset
//! means binary-searching the segment table for the owning file, then that
//! file's group descriptors, then lazily parsing the group's table section
//! into a [`DataList`] of chunk descriptors.

use std::io::{Read, Seek};

use bit_field::BitField;
use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::cache::{Cache, CacheKey};
use crate::checksum::adler32;
use crate::chunk::RangeFlags;
use crate::lazy::{DataDescriptor, DataList};
use crate::pool::FileIoPool;
use crate::{Error, Result};

/// Size of the fixed header of a `table` section.
pub(crate) const TABLE_HEADER_SIZE: usize = 24;

/// The most offsets one table section may carry.
pub(crate) const MAX_TABLE_ENTRIES: u32 = 16375;

/// High bit of a table entry: set when the chunk payload is compressed.
pub(crate) const COMPRESSED_BIT: usize = 31;

/// One chunk group inside a segment file, as located by the container
/// framing at open time. The group's chunk descriptors are parsed lazily
/// from the referenced table section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGroupDescriptor {
    /// Logical offset of the group's first media byte, relative to the
    /// start of the segment file's extent.
    pub data_offset: u64,
    /// Logical media bytes covered by the group.
    pub data_size: u64,
    pub number_of_chunks: u32,
    /// File offset of the group's `table` section.
    pub table_offset: u64,
    /// File offset of the redundant `table2` copy, when present.
    pub table2_offset: Option<u64>,
    /// File offset one past the last chunk payload, used to size the
    /// final chunk of the group.
    pub sectors_end: u64,
}

/// A single `.E0n` file: its place in the logical image and its chunk
/// groups.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    /// 1-based segment number, matching the file extension sequence.
    pub segment_number: u32,
    /// Logical image offset of the first media byte in this file.
    pub start_offset: u64,
    /// Logical media bytes covered by this file.
    pub size: u64,
    /// Entry in the file I/O pool holding this file.
    pub pool_entry: usize,
    chunk_groups: Vec<ChunkGroupDescriptor>,
}

impl SegmentFile {
    pub fn new(segment_number: u32, start_offset: u64, size: u64, pool_entry: usize) -> Self {
        SegmentFile {
            segment_number,
            start_offset,
            size,
            pool_entry,
            chunk_groups: Vec::new(),
        }
    }

    pub fn number_of_chunk_groups(&self) -> usize {
        self.chunk_groups.len()
    }

    pub fn chunk_group(&self, index: usize) -> Option<&ChunkGroupDescriptor> {
        self.chunk_groups.get(index)
    }

    /// Register a chunk group. Groups must be appended in ascending
    /// logical order and must not overlap.
    pub fn add_chunk_group(&mut self, descriptor: ChunkGroupDescriptor) -> Result<()> {
        if let Some(last) = self.chunk_groups.last() {
            if descriptor.data_offset < last.data_offset + last.data_size {
                return Err(Error::InvalidInput(
                    "chunk groups must be sorted and non-overlapping",
                ));
            }
        }
        self.chunk_groups.push(descriptor);
        Ok(())
    }

    /// The group containing the segment-relative offset, with the offset
    /// translated to be relative to the group.
    pub fn group_index_at_offset(&self, segment_offset: u64) -> Option<(usize, u64)> {
        let index = self
            .chunk_groups
            .partition_point(|g| g.data_offset + g.data_size <= segment_offset);
        let group = self.chunk_groups.get(index)?;
        if segment_offset < group.data_offset {
            return None;
        }
        Some((index, segment_offset - group.data_offset))
    }

    /// Resolve a segment-relative offset to its chunk group's chunks
    /// list, parsing the group's table section on a cache miss. Returns
    /// the group index, the offset relative to the group, and the list.
    pub fn chunk_group_by_offset<'c, S: Read + Seek>(
        &self,
        pool: &FileIoPool<S>,
        groups_cache: &'c mut Cache<DataList>,
        chunk_size: u32,
        segment_index: usize,
        segment_offset: u64,
    ) -> Result<Option<(usize, u64, &'c mut DataList)>> {
        let (group_index, group_offset) = match self.group_index_at_offset(segment_offset) {
            Some(found) => found,
            None => return Ok(None),
        };
        let key = CacheKey {
            list_id: segment_index as u64,
            index: group_index,
            generation: 0,
        };
        if !groups_cache.contains(&key) {
            let descriptor = &self.chunk_groups[group_index];
            let list_id = chunks_list_id(segment_index, group_index);
            let list = self.materialize_group(pool, descriptor, chunk_size, list_id)?;
            groups_cache.insert(key, list);
        }
        match groups_cache.get_mut(&key) {
            Some(list) => Ok(Some((group_index, group_offset, list))),
            None => Ok(None),
        }
    }

    /// Parse a group's table section, falling back to `table2` when the
    /// primary copy is damaged.
    fn materialize_group<S: Read + Seek>(
        &self,
        pool: &FileIoPool<S>,
        descriptor: &ChunkGroupDescriptor,
        chunk_size: u32,
        list_id: u64,
    ) -> Result<DataList> {
        match read_table_section(pool, self.pool_entry, descriptor.table_offset, descriptor, chunk_size, list_id)
        {
            Ok(list) => Ok(list),
            Err(Error::Corrupt(reason)) => {
                let table2_offset = match descriptor.table2_offset {
                    Some(offset) => offset,
                    None => return Err(Error::Corrupt(reason)),
                };
                warn!(
                    "segment file {}: table section at offset {} is corrupt ({}), trying table2",
                    self.segment_number, descriptor.table_offset, reason
                );
                read_table_section(pool, self.pool_entry, table2_offset, descriptor, chunk_size, list_id)
            }
            Err(e) => Err(e),
        }
    }
}

/// Identity of a group's chunks list, unique across the whole image so
/// chunk cache keys from different groups never collide.
fn chunks_list_id(segment_index: usize, group_index: usize) -> u64 {
    ((segment_index as u64 + 1) << 32) | group_index as u64
}

/// Parse one `table` section into a list of chunk descriptors.
///
/// Layout: `{ number_of_offsets: u32, pad: [u8; 4], base_offset: u64,
/// pad: [u8; 4], checksum: u32 }` where the checksum is an Adler-32 over
/// the preceding 20 bytes, followed by `number_of_offsets` little-endian
/// `u32` entries and an Adler-32 over the raw entry bytes. Entry bit 31
/// flags a compressed chunk; the remaining bits plus `base_offset` give
/// the payload offset within the segment file.
fn read_table_section<S: Read + Seek>(
    pool: &FileIoPool<S>,
    pool_entry: usize,
    table_offset: u64,
    descriptor: &ChunkGroupDescriptor,
    chunk_size: u32,
    list_id: u64,
) -> Result<DataList> {
    let mut header = [0u8; TABLE_HEADER_SIZE];
    pool.read_exact_at(pool_entry, table_offset, &mut header)?;

    let number_of_offsets = LittleEndian::read_u32(&header[0..4]);
    let base_offset = LittleEndian::read_u64(&header[8..16]);
    let stored_checksum = LittleEndian::read_u32(&header[20..24]);

    if adler32(&header[..20]) != stored_checksum {
        return Err(Error::Corrupt("table header checksum mismatch".to_string()));
    }
    if number_of_offsets == 0 || number_of_offsets > MAX_TABLE_ENTRIES {
        return Err(Error::Corrupt(format!(
            "table claims {number_of_offsets} offsets"
        )));
    }
    if number_of_offsets != descriptor.number_of_chunks {
        return Err(Error::Corrupt(format!(
            "table holds {} offsets but the group describes {} chunks",
            number_of_offsets, descriptor.number_of_chunks
        )));
    }

    let entries_size = number_of_offsets as usize * 4;
    let mut entries = vec![0u8; entries_size + 4];
    pool.read_exact_at(pool_entry, table_offset + TABLE_HEADER_SIZE as u64, &mut entries)?;

    let stored_entries_checksum = LittleEndian::read_u32(&entries[entries_size..]);
    if adler32(&entries[..entries_size]) != stored_entries_checksum {
        return Err(Error::Corrupt(
            "table entries checksum mismatch".to_string(),
        ));
    }

    let mut offsets = Vec::with_capacity(number_of_offsets as usize);
    for raw in entries[..entries_size].chunks_exact(4) {
        let entry = LittleEndian::read_u32(raw);
        let compressed = entry.get_bit(COMPRESSED_BIT);
        let file_offset = base_offset + u64::from(entry.get_bits(0..COMPRESSED_BIT));
        offsets.push((file_offset, compressed));
    }

    let mut list = DataList::new(list_id);
    let count = offsets.len();
    let full_chunks = count as u64 - 1;
    if descriptor.data_size <= full_chunks * u64::from(chunk_size)
        || descriptor.data_size > count as u64 * u64::from(chunk_size)
    {
        return Err(Error::Corrupt(format!(
            "group of {} chunks cannot cover {} media bytes",
            count, descriptor.data_size
        )));
    }

    for (index, &(file_offset, compressed)) in offsets.iter().enumerate() {
        let next_offset = match offsets.get(index + 1) {
            Some(&(next, _)) => next,
            None => descriptor.sectors_end,
        };
        if next_offset <= file_offset {
            return Err(Error::Corrupt(format!(
                "table entry {index} does not precede its successor"
            )));
        }
        let mut range_flags = RangeFlags::empty();
        if compressed {
            range_flags |= RangeFlags::COMPRESSED;
        }
        let mapped_size = if index + 1 == count {
            descriptor.data_size - full_chunks * u64::from(chunk_size)
        } else {
            u64::from(chunk_size)
        };
        list.append(
            DataDescriptor {
                data_offset: file_offset,
                data_size: next_offset - file_offset,
                range_flags,
            },
            mapped_size,
        );
    }
    Ok(list)
}

/// The ordered set of segment files making up an image.
#[derive(Debug, Clone, Default)]
pub struct SegmentTable {
    segments: Vec<SegmentFile>,
}

impl SegmentTable {
    pub fn new() -> Self {
        SegmentTable::default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Logical bytes covered by all segment files together.
    pub fn total_size(&self) -> u64 {
        self.segments.last().map_or(0, |s| s.start_offset + s.size)
    }

    pub fn get(&self, index: usize) -> Option<&SegmentFile> {
        self.segments.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentFile> {
        self.segments.iter()
    }

    /// Append the next segment file. Extents must be contiguous and the
    /// segment numbers sequential from one.
    pub fn append(&mut self, segment: SegmentFile) -> Result<()> {
        if segment.segment_number != self.segments.len() as u32 + 1 {
            return Err(Error::InvalidInput("segment numbers must be sequential"));
        }
        if segment.start_offset != self.total_size() {
            return Err(Error::InvalidInput("segment extents must be contiguous"));
        }
        self.segments.push(segment);
        Ok(())
    }

    /// The segment file owning a logical offset, with the offset made
    /// relative to that file's extent. `None` past the covered range.
    pub fn segment_at_offset(&self, offset: u64) -> Option<(usize, u64)> {
        if offset >= self.total_size() {
            return None;
        }
        let index = self
            .segments
            .partition_point(|s| s.start_offset + s.size <= offset);
        let segment = self.segments.get(index)?;
        Some((index, offset - segment.start_offset))
    }
}

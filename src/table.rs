//! The chunk table: routes reads and writes through the delta overlay or
//! the primary chunk groups, absorbs payload corruption into per-chunk
//! flags and the checksum-error list, and clones itself for concurrent
//! readers.

use std::io::{Read, Seek};
use std::sync::Arc;

use log::warn;

use crate::cache::{Cache, CacheKey};
use crate::chunk::{ChunkData, RangeFlags};
use crate::lazy::{DataDescriptor, DataList, ElementReader, RangeList};
use crate::media::{IoHandle, MediaValues};
use crate::pool::FileIoPool;
use crate::segment::SegmentTable;
use crate::{Error, Result};

/// Cached chunk groups per handle.
const CHUNK_GROUPS_CACHE_SIZE: usize = 8;

/// Cached chunks per handle.
const CHUNKS_CACHE_SIZE: usize = 8;

/// List identity under which synthesized chunks (holes in the recorded
/// chunk tables) are cached.
const SYNTHESIZED_LIST_ID: u64 = u64::MAX;

/// Reads a chunk's stored bytes out of the file I/O pool, producing a
/// packed [`ChunkData`] flagged from its group descriptor.
struct ChunkReader<'a, S> {
    pool: &'a FileIoPool<S>,
    pool_entry: usize,
}

impl<S: Read + Seek> ElementReader for ChunkReader<'_, S> {
    type Value = ChunkData;

    fn read_element(&mut self, descriptor: &DataDescriptor) -> Result<ChunkData> {
        let mut stored = vec![0u8; descriptor.data_size as usize];
        self.pool
            .read_exact_at(self.pool_entry, descriptor.data_offset, &mut stored)?;
        Ok(ChunkData::from_stored(stored, descriptor.range_flags))
    }
}

/// Chunk-level access to one opened image.
///
/// Reads resolve through the delta overlay first, then the segment table;
/// loaded chunks are unpacked in place and kept in a small LRU cache, so a
/// chunk that failed verification keeps returning the same corrupted state
/// without touching disk again.
#[derive(Debug)]
pub struct ChunkTable<S> {
    io_handle: Arc<IoHandle>,
    media: Arc<MediaValues>,
    segments: Arc<SegmentTable>,
    pool: Arc<FileIoPool<S>>,
    delta_chunks: RangeList<ChunkData>,
    groups_cache: Cache<DataList>,
    chunks_cache: Cache<ChunkData>,
    checksum_errors: RangeList<()>,
}

impl<S: Read + Seek> ChunkTable<S> {
    pub fn new(
        io_handle: Arc<IoHandle>,
        media: Arc<MediaValues>,
        segments: Arc<SegmentTable>,
        pool: Arc<FileIoPool<S>>,
    ) -> Self {
        Self::with_cache_capacities(
            io_handle,
            media,
            segments,
            pool,
            CHUNK_GROUPS_CACHE_SIZE,
            CHUNKS_CACHE_SIZE,
        )
    }

    /// A chunk table with chosen cache capacities, for callers that trade
    /// memory against re-reads differently than the defaults.
    pub fn with_cache_capacities(
        io_handle: Arc<IoHandle>,
        media: Arc<MediaValues>,
        segments: Arc<SegmentTable>,
        pool: Arc<FileIoPool<S>>,
        chunk_groups_cache_size: usize,
        chunks_cache_size: usize,
    ) -> Self {
        ChunkTable {
            io_handle,
            media,
            segments,
            pool,
            delta_chunks: RangeList::new(),
            groups_cache: Cache::new(chunk_groups_cache_size),
            chunks_cache: Cache::new(chunks_cache_size),
            checksum_errors: RangeList::new(),
        }
    }

    /// A handle for an independent reader thread. Immutable image state is
    /// shared; the delta overlay and checksum-error list are deep copies
    /// and the caches start out empty, so clones never contend beyond the
    /// file I/O pool's per-entry locks. Checksum-error lists diverge from
    /// here on; merge them caller-side if a union is needed.
    pub fn clone_for_read(&self) -> Self {
        ChunkTable {
            io_handle: Arc::clone(&self.io_handle),
            media: Arc::clone(&self.media),
            segments: Arc::clone(&self.segments),
            pool: Arc::clone(&self.pool),
            delta_chunks: self.delta_chunks.clone(),
            groups_cache: Cache::new(self.groups_cache.capacity()),
            chunks_cache: Cache::new(self.chunks_cache.capacity()),
            checksum_errors: self.checksum_errors.clone(),
        }
    }

    pub fn media(&self) -> &MediaValues {
        &self.media
    }

    /// Whether a chunk is recorded for this offset, without materializing
    /// it. `Ok(false)` for offsets past the media or inside table holes.
    pub fn chunk_exists_for_offset(&mut self, offset: u64) -> Result<bool> {
        if offset >= self.media.media_size {
            return Ok(false);
        }
        let (segment_index, segment_offset) = match self.segments.segment_at_offset(offset) {
            Some(found) => found,
            None => return Ok(false),
        };
        let segments = Arc::clone(&self.segments);
        let segment = match segments.get(segment_index) {
            Some(segment) => segment,
            None => return Ok(false),
        };
        let found = segment.chunk_group_by_offset(
            &self.pool,
            &mut self.groups_cache,
            self.media.chunk_size,
            segment_index,
            segment_offset,
        )?;
        Ok(match found {
            Some((_, group_offset, chunks_list)) => {
                chunks_list.index_at_offset(group_offset).is_some()
            }
            None => false,
        })
    }

    /// Retrieve the chunk covering `offset`, loading and unpacking it as
    /// needed. Returns the chunk and the logical offset of its first byte.
    ///
    /// A chunk that fails verification is *returned successfully* with
    /// [`RangeFlags::IS_CORRUPTED`] set, zeroed if the handle asks for
    /// that, and its sector range is recorded in the checksum-error list.
    /// Only offsets at or past the media end are an error.
    pub fn get_chunk_data_by_offset(&mut self, offset: u64) -> Result<(&ChunkData, u64)> {
        if offset >= self.media.media_size {
            return Err(Error::OutOfBounds(offset));
        }
        let chunk_size = u64::from(self.media.chunk_size);
        let chunk_index = offset / chunk_size;
        let chunk_offset = chunk_index * chunk_size;
        let logical_size = self.media.chunk_logical_size(chunk_index);

        // Delta chunks shadow the primary stream.
        if self.delta_chunks.get_at_offset(offset).is_some() {
            let io_handle = Arc::clone(&self.io_handle);
            let media = Arc::clone(&self.media);
            let (start, _, chunk) = self.delta_chunks.get_mut_at_offset(offset).unwrap();
            finish_chunk(
                chunk,
                &mut self.checksum_errors,
                &io_handle,
                &media,
                chunk_index,
                logical_size,
            )?;
            return Ok((&*chunk, start));
        }

        let key = self.materialize_primary(offset, chunk_index, logical_size)?;
        let io_handle = Arc::clone(&self.io_handle);
        let media = Arc::clone(&self.media);
        match self.chunks_cache.get_mut(&key) {
            Some(chunk) => {
                finish_chunk(
                    chunk,
                    &mut self.checksum_errors,
                    &io_handle,
                    &media,
                    chunk_index,
                    logical_size,
                )?;
                Ok((&*chunk, chunk_offset))
            }
            // the cache holds at least one slot, so the entry we just
            // inserted cannot have been evicted already
            None => Err(Error::InvalidInput("chunk vanished from the cache")),
        }
    }

    /// Ensure the primary chunk for `offset` sits in the chunks cache,
    /// loading it from its segment file or synthesizing a zeroed corrupted
    /// chunk when the recorded tables have a hole. Returns its cache key.
    fn materialize_primary(
        &mut self,
        offset: u64,
        chunk_index: u64,
        logical_size: usize,
    ) -> Result<CacheKey> {
        let segments = Arc::clone(&self.segments);
        let pool = Arc::clone(&self.pool);

        if let Some((segment_index, segment_offset)) = segments.segment_at_offset(offset) {
            if let Some(segment) = segments.get(segment_index) {
                let found = segment.chunk_group_by_offset(
                    &pool,
                    &mut self.groups_cache,
                    self.media.chunk_size,
                    segment_index,
                    segment_offset,
                )?;
                if let Some((_, group_offset, chunks_list)) = found {
                    let mut reader = ChunkReader {
                        pool: &pool,
                        pool_entry: segment.pool_entry,
                    };
                    if let Some((element_index, _, _)) = chunks_list.get_value_at_offset(
                        &mut reader,
                        &mut self.chunks_cache,
                        group_offset,
                    )? {
                        return Ok(chunks_list.cache_key(element_index));
                    }
                }
            }
        }

        // No chunk recorded inside the media bounds: acquisition lost it.
        let key = CacheKey {
            list_id: SYNTHESIZED_LIST_ID,
            index: chunk_index as usize,
            generation: 0,
        };
        if !self.chunks_cache.contains(&key) {
            warn!("no chunk recorded for media offset {offset}, treating as corrupted");
            self.chunks_cache
                .insert(key, ChunkData::missing(logical_size));
        }
        Ok(key)
    }

    /// Store a chunk at `offset`. Delta chunks go to the delta overlay,
    /// replacing any earlier rewrite of the same range. Non-delta chunks
    /// replace the cached primary chunk, which is only meaningful during
    /// acquisition before the chunk has been persisted.
    pub fn set_chunk_data_by_offset(&mut self, offset: u64, mut chunk: ChunkData) -> Result<()> {
        if offset >= self.media.media_size {
            return Err(Error::OutOfBounds(offset));
        }
        let chunk_size = u64::from(self.media.chunk_size);
        let chunk_index = offset / chunk_size;
        let chunk_offset = chunk_index * chunk_size;
        let logical_size = self.media.chunk_logical_size(chunk_index) as u64;

        if chunk.range_flags().contains(RangeFlags::IS_DELTA) {
            self.delta_chunks.set(chunk_offset, logical_size, chunk);
            return Ok(());
        }

        let segments = Arc::clone(&self.segments);
        let pool = Arc::clone(&self.pool);
        let (segment_index, segment_offset) = segments
            .segment_at_offset(offset)
            .ok_or(Error::OutOfBounds(offset))?;
        let segment = segments
            .get(segment_index)
            .ok_or(Error::OutOfBounds(offset))?;
        let found = segment.chunk_group_by_offset(
            &pool,
            &mut self.groups_cache,
            self.media.chunk_size,
            segment_index,
            segment_offset,
        )?;
        let (_, group_offset, chunks_list) = found.ok_or(Error::OutOfBounds(offset))?;
        let (element_index, _) = chunks_list
            .index_at_offset(group_offset)
            .ok_or(Error::OutOfBounds(offset))?;
        chunk.taint();
        self.chunks_cache
            .insert(chunks_list.cache_key(element_index), chunk);
        Ok(())
    }

    /// Copy bytes out of the image into `buf`, starting at `offset` and
    /// honouring the delta overlay. Returns the bytes copied, which falls
    /// short of `buf.len()` only at the media end.
    ///
    /// A corrupted chunk kept un-zeroed may hold fewer or more bytes than
    /// its place in the media; the copy is clamped to the chunk's logical
    /// extent and missing bytes read as zero.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut copied = 0;
        while copied < buf.len() {
            let position = offset + copied as u64;
            if position >= self.media.media_size {
                break;
            }
            let chunk_index = position / u64::from(self.media.chunk_size);
            let logical_size = self.media.chunk_logical_size(chunk_index);

            let (chunk, chunk_offset) = self.get_chunk_data_by_offset(position)?;
            let data = chunk.data();
            let within = (position - chunk_offset) as usize;
            let take = (logical_size - within).min(buf.len() - copied);

            let available = data.len().saturating_sub(within).min(take);
            buf[copied..copied + available].copy_from_slice(&data[within..within + available]);
            buf[copied + available..copied + take].fill(0);
            copied += take;
        }
        Ok(copied)
    }

    pub fn number_of_checksum_errors(&self) -> u32 {
        self.checksum_errors.len() as u32
    }

    /// The checksum error at `index`, in ascending sector order, as
    /// `(start_sector, number_of_sectors)`.
    pub fn checksum_error(&self, index: u32) -> Option<(u64, u64)> {
        self.checksum_errors.range(index as usize)
    }

    /// Record a sector range as damaged, merging with neighbours.
    pub fn append_checksum_error(&mut self, start_sector: u64, number_of_sectors: u64) {
        self.checksum_errors
            .insert_merged(start_sector, number_of_sectors);
    }
}

/// Unpack a materialized chunk and absorb any corruption: zero the payload
/// when the handle asks for it and record the damaged sector range.
fn finish_chunk(
    chunk: &mut ChunkData,
    checksum_errors: &mut RangeList<()>,
    io_handle: &IoHandle,
    media: &MediaValues,
    chunk_index: u64,
    logical_size: usize,
) -> Result<()> {
    chunk.unpack(logical_size, io_handle.compression_method)?;
    if chunk.is_corrupted() {
        if io_handle.zero_on_error {
            chunk.zero(logical_size);
        }
        let start_sector = chunk_index * u64::from(media.sectors_per_chunk);
        let number_of_sectors = u64::from(media.sectors_per_chunk)
            .min(media.number_of_sectors.saturating_sub(start_sector));
        checksum_errors.insert_merged(start_sector, number_of_sectors);
    }
    Ok(())
}

//! Helpers for building complete in-memory images.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{
    ChunkTable, CompressionFlags, CompressionLevel, CompressionMethod, FileIoPool, IoHandle,
    MediaValues, Result, SegmentFile, SegmentTable, SegmentWriter,
};

/// Media bytes with a position-dependent pattern, so any misrouted read
/// shows up as a mismatch.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(2654435761).to_le_bytes()[1])
        .collect()
}

/// The S1 geometry: 32 KiB chunks over a 100 000 byte media.
pub fn media_100k() -> Arc<MediaValues> {
    Arc::new(MediaValues::with_media_size(64, 512, 100_000).unwrap())
}

pub fn deflate_handle(zero_on_error: bool) -> Arc<IoHandle> {
    Arc::new(IoHandle::new(
        CompressionMethod::Deflate,
        CompressionLevel::Best,
        CompressionFlags::empty(),
        zero_on_error,
    ))
}

/// Chunks stored raw with Adler-32 trailers, at predictable offsets.
pub fn stored_handle(zero_on_error: bool) -> Arc<IoHandle> {
    Arc::new(IoHandle::new(
        CompressionMethod::None,
        CompressionLevel::None,
        CompressionFlags::empty(),
        zero_on_error,
    ))
}

/// Write `media_bytes` into segment files of at most `chunks_per_segment`
/// chunks each, returning the raw file images and their metadata.
pub fn build_segments(
    media_bytes: &[u8],
    media: &Arc<MediaValues>,
    io_handle: &Arc<IoHandle>,
    chunks_per_segment: usize,
) -> Result<(Vec<Vec<u8>>, Vec<SegmentFile>)> {
    let chunk_size = media.chunk_size as usize;
    let chunks: Vec<&[u8]> = media_bytes.chunks(chunk_size).collect();

    let mut images = Vec::new();
    let mut segments = Vec::new();
    let mut start_offset = 0;
    for (index, group) in chunks.chunks(chunks_per_segment).enumerate() {
        let mut writer = SegmentWriter::new(
            Cursor::new(Vec::new()),
            Arc::clone(io_handle),
            Arc::clone(media),
            index as u32 + 1,
            start_offset,
        )?;
        for chunk in group {
            writer.write_chunk(chunk)?;
        }
        let (segment, io) = writer.finish(index)?;
        start_offset += segment.size;
        segments.push(segment);
        images.push(io.into_inner());
    }
    Ok((images, segments))
}

/// Open previously built segment images as a chunk table.
pub fn open_segments(
    images: Vec<Vec<u8>>,
    segments: Vec<SegmentFile>,
    media: Arc<MediaValues>,
    io_handle: Arc<IoHandle>,
) -> Result<ChunkTable<Cursor<Vec<u8>>>> {
    let mut pool = FileIoPool::new(4);
    for image in images {
        pool.append(move || Ok(Cursor::new(image.clone())));
    }
    let mut table = SegmentTable::new();
    for segment in segments {
        table.append(segment)?;
    }
    Ok(ChunkTable::new(
        io_handle,
        media,
        Arc::new(table),
        Arc::new(pool),
    ))
}

/// Build and open in one step.
pub fn image_of(
    media_bytes: &[u8],
    media: &Arc<MediaValues>,
    io_handle: &Arc<IoHandle>,
    chunks_per_segment: usize,
) -> Result<ChunkTable<Cursor<Vec<u8>>>> {
    let (images, segments) = build_segments(media_bytes, media, io_handle, chunks_per_segment)?;
    open_segments(
        images,
        segments,
        Arc::clone(media),
        Arc::clone(io_handle),
    )
}

/// A cursor that counts every read issued against it, shared across
/// reopenings by the pool.
pub struct CountingCursor {
    inner: Cursor<Vec<u8>>,
    reads: Arc<AtomicUsize>,
}

impl Read for CountingCursor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read(buf)
    }
}

impl Seek for CountingCursor {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Open segment images behind counting cursors, with a chosen chunk-group
/// cache capacity. Returns the table and the shared read counter.
pub fn open_counting(
    images: Vec<Vec<u8>>,
    segments: Vec<SegmentFile>,
    media: Arc<MediaValues>,
    io_handle: Arc<IoHandle>,
    groups_cache_size: usize,
) -> Result<(ChunkTable<CountingCursor>, Arc<AtomicUsize>)> {
    let reads = Arc::new(AtomicUsize::new(0));
    let mut pool = FileIoPool::new(4);
    for image in images {
        let reads = Arc::clone(&reads);
        pool.append(move || {
            Ok(CountingCursor {
                inner: Cursor::new(image.clone()),
                reads: Arc::clone(&reads),
            })
        });
    }
    let mut table = SegmentTable::new();
    for segment in segments {
        table.append(segment)?;
    }
    let chunk_table = ChunkTable::with_cache_capacities(
        io_handle,
        media,
        Arc::new(table),
        Arc::new(pool),
        groups_cache_size,
        8,
    );
    Ok((chunk_table, reads))
}

//! Reading across chunk and segment boundaries, tail chunk included.

use super::builder::*;
use crate::{CompressionMethod, Error};

#[test]
fn chunk_reads_across_the_whole_media() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    for (offset, expected_len) in [(0u64, 32768), (32768, 32768), (65536, 32768), (98304, 1696)] {
        let (chunk, chunk_offset) = table.get_chunk_data_by_offset(offset).unwrap();
        assert_eq!(chunk_offset, offset);
        assert_eq!(chunk.data_size(), expected_len);
        assert!(!chunk.is_corrupted());
        assert_eq!(
            chunk.data(),
            &data[offset as usize..offset as usize + expected_len]
        );
    }

    assert!(matches!(
        table.get_chunk_data_by_offset(100_000),
        Err(Error::OutOfBounds(100_000))
    ));
    assert!(matches!(
        table.get_chunk_data_by_offset(u64::MAX),
        Err(Error::OutOfBounds(_))
    ));
}

#[test]
fn unaligned_reads_resolve_to_their_chunk() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    let (chunk, chunk_offset) = table.get_chunk_data_by_offset(40_000).unwrap();
    assert_eq!(chunk_offset, 32768);
    assert_eq!(chunk.data(), &data[32768..65536]);

    let (chunk, chunk_offset) = table.get_chunk_data_by_offset(99_999).unwrap();
    assert_eq!(chunk_offset, 98304);
    assert_eq!(chunk.data_size(), 1696);
}

#[test]
fn read_at_reconstructs_the_media() {
    let media = media_100k();
    let data = patterned(100_000);

    for handle in [deflate_handle(false), stored_handle(false)] {
        let mut table = image_of(&data, &media, &handle, 64).unwrap();
        let mut out = vec![0u8; 100_000];
        let read = table.read_at(0, &mut out).unwrap();
        assert_eq!(read, 100_000);
        assert_eq!(out, data);
    }
}

#[test]
fn read_at_stops_at_the_media_end() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    let mut out = vec![0u8; 4096];
    let read = table.read_at(99_000, &mut out).unwrap();
    assert_eq!(read, 1000);
    assert_eq!(&out[..1000], &data[99_000..]);
}

#[test]
fn reads_span_segment_files() {
    let media = media_100k();
    let data = patterned(100_000);
    // two chunks per segment file: 0..2, 2..4
    let mut table = image_of(&data, &media, &deflate_handle(false), 2).unwrap();

    let mut out = vec![0u8; 100_000];
    table.read_at(0, &mut out).unwrap();
    assert_eq!(out, data);

    // a read crossing the segment boundary at 65536
    let mut out = vec![0u8; 8192];
    table.read_at(65536 - 4096, &mut out).unwrap();
    assert_eq!(out, data[65536 - 4096..65536 + 4096]);
}

#[test]
fn bzip2_images_read_back() {
    use crate::{CompressionFlags, CompressionLevel, IoHandle};
    use std::sync::Arc;

    let media = media_100k();
    let data = patterned(100_000);
    let handle = Arc::new(IoHandle::new(
        CompressionMethod::Bzip2,
        CompressionLevel::Fast,
        CompressionFlags::empty(),
        false,
    ));
    let mut table = image_of(&data, &media, &handle, 64).unwrap();
    let mut out = vec![0u8; 100_000];
    table.read_at(0, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn chunk_existence_probes() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    assert!(table.chunk_exists_for_offset(0).unwrap());
    assert!(table.chunk_exists_for_offset(99_999).unwrap());
    assert!(!table.chunk_exists_for_offset(100_000).unwrap());
}

#[test]
fn cached_chunks_do_not_reread() {
    let media = media_100k();
    let data = patterned(100_000);
    let (images, segments) =
        build_segments(&data, &media, &deflate_handle(false), 64).unwrap();
    let (mut table, reads) = open_counting(
        images,
        segments,
        media.clone(),
        deflate_handle(false),
        8,
    )
    .unwrap();

    table.get_chunk_data_by_offset(0).unwrap();
    let after_first = reads.load(std::sync::atomic::Ordering::Relaxed);
    table.get_chunk_data_by_offset(100).unwrap();
    table.get_chunk_data_by_offset(32_000).unwrap();
    assert_eq!(reads.load(std::sync::atomic::Ordering::Relaxed), after_first);
}

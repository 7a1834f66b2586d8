//! Delta chunks shadow the primary chunk stream at read time.

use super::builder::*;
use crate::{ChunkData, CompressionLevel, CompressionMethod, PackFlags, RangeFlags};

#[test]
fn delta_chunk_shadows_its_range() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    let rewrite = vec![0xDDu8; 32768];
    table
        .set_chunk_data_by_offset(65536, ChunkData::delta(rewrite.clone()))
        .unwrap();

    // every offset within the rewritten chunk resolves to the delta
    for offset in [65536u64, 70_000, 98_303] {
        let (chunk, chunk_offset) = table.get_chunk_data_by_offset(offset).unwrap();
        assert_eq!(chunk_offset, 65536);
        assert!(chunk.range_flags().contains(RangeFlags::IS_DELTA));
        assert_eq!(chunk.data(), &rewrite[..]);
    }

    // offsets before and after still read primary data
    let (chunk, _) = table.get_chunk_data_by_offset(0).unwrap();
    assert_eq!(chunk.data(), &data[..32768]);
    let (chunk, _) = table.get_chunk_data_by_offset(98_304).unwrap();
    assert_eq!(chunk.data(), &data[98_304..]);
}

#[test]
fn read_at_blends_delta_and_primary() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    table
        .set_chunk_data_by_offset(65536, ChunkData::delta(vec![0xDDu8; 32768]))
        .unwrap();

    let mut out = vec![0u8; 100_000];
    table.read_at(0, &mut out).unwrap();
    assert_eq!(&out[..65536], &data[..65536]);
    assert!(out[65536..98304].iter().all(|&b| b == 0xDD));
    assert_eq!(&out[98304..], &data[98304..]);
}

#[test]
fn rewriting_a_delta_replaces_the_entry() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    table
        .set_chunk_data_by_offset(32768, ChunkData::delta(vec![0x11u8; 32768]))
        .unwrap();
    table
        .set_chunk_data_by_offset(32768, ChunkData::delta(vec![0x22u8; 32768]))
        .unwrap();

    let (chunk, _) = table.get_chunk_data_by_offset(40_000).unwrap();
    assert!(chunk.data().iter().all(|&b| b == 0x22));
}

#[test]
fn packed_delta_chunks_unpack_on_read() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    // a delta chunk may arrive already packed, pattern fill included
    let pattern: Vec<u8> = [0xABu8, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89]
        .iter()
        .copied()
        .cycle()
        .take(32768)
        .collect();
    let mut chunk = ChunkData::delta(pattern.clone());
    chunk
        .pack(
            media.chunk_size,
            CompressionMethod::Deflate,
            CompressionLevel::Best,
            None,
            PackFlags::USE_PATTERN_FILL,
        )
        .unwrap();
    table.set_chunk_data_by_offset(0, chunk).unwrap();

    let (read_back, _) = table.get_chunk_data_by_offset(100).unwrap();
    assert_eq!(read_back.data(), &pattern[..]);
}

#[test]
fn packed_tail_delta_uses_a_pattern_record() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    // the tail chunk holds 1696 bytes; a pattern-repeating rewrite of it
    // still packs down to the 16-byte record
    let rewrite: Vec<u8> = [0x66u8, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD]
        .iter()
        .copied()
        .cycle()
        .take(1696)
        .collect();
    let mut chunk = ChunkData::delta(rewrite.clone());
    chunk
        .pack(
            media.chunk_size,
            CompressionMethod::Deflate,
            CompressionLevel::Best,
            None,
            PackFlags::USE_PATTERN_FILL,
        )
        .unwrap();
    assert_eq!(chunk.write_size().unwrap(), 16);

    table.set_chunk_data_by_offset(98_304, chunk).unwrap();

    let (read_back, chunk_offset) = table.get_chunk_data_by_offset(99_000).unwrap();
    assert_eq!(chunk_offset, 98_304);
    assert!(!read_back.is_corrupted());
    assert_eq!(read_back.data(), &rewrite[..]);
}

#[test]
fn tail_delta_covers_the_short_chunk() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();

    table
        .set_chunk_data_by_offset(98_304, ChunkData::delta(vec![0x77u8; 1696]))
        .unwrap();

    let (chunk, chunk_offset) = table.get_chunk_data_by_offset(99_000).unwrap();
    assert_eq!(chunk_offset, 98_304);
    assert_eq!(chunk.data_size(), 1696);
    assert!(chunk.data().iter().all(|&b| b == 0x77));
}

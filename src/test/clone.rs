//! Clone semantics: immutable image state is shared, mutable state is
//! copied, and clones work from other threads without extra locking.

use std::sync::Arc;

use super::builder::*;
use crate::ChunkData;

#[test]
fn clones_read_the_same_image() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 2).unwrap();
    let mut clone = table.clone_for_read();

    let mut a = vec![0u8; 100_000];
    let mut b = vec![0u8; 100_000];
    table.read_at(0, &mut a).unwrap();
    clone.read_at(0, &mut b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn checksum_errors_diverge_after_cloning() {
    let media = media_100k();
    let data = patterned(100_000);
    let (mut images, segments) =
        build_segments(&data, &media, &stored_handle(true), 64).unwrap();
    images[0][32772 + 32768] ^= 0x01; // chunk 1 trailer

    let mut table =
        open_segments(images, segments, media.clone(), stored_handle(true)).unwrap();

    let clone_before = table.clone_for_read();
    table.get_chunk_data_by_offset(32768).unwrap();

    assert_eq!(table.number_of_checksum_errors(), 1);
    assert_eq!(clone_before.number_of_checksum_errors(), 0);

    // errors found before the clone are carried into it
    let clone_after = table.clone_for_read();
    assert_eq!(clone_after.number_of_checksum_errors(), 1);
    assert_eq!(clone_after.checksum_error(0), Some((64, 64)));
}

#[test]
fn delta_chunks_are_deep_copied() {
    let media = media_100k();
    let data = patterned(100_000);
    let mut table = image_of(&data, &media, &deflate_handle(false), 64).unwrap();
    table
        .set_chunk_data_by_offset(0, ChunkData::delta(vec![0xEEu8; 32768]))
        .unwrap();

    let mut clone = table.clone_for_read();
    let (chunk, _) = clone.get_chunk_data_by_offset(0).unwrap();
    assert!(chunk.data().iter().all(|&b| b == 0xEE));

    // a rewrite in the clone does not leak back into the original
    clone
        .set_chunk_data_by_offset(0, ChunkData::delta(vec![0x33u8; 32768]))
        .unwrap();
    let (chunk, _) = table.get_chunk_data_by_offset(0).unwrap();
    assert!(chunk.data().iter().all(|&b| b == 0xEE));
}

#[test]
fn clones_run_on_separate_threads() {
    let media = media_100k();
    let data = Arc::new(patterned(100_000));
    let table = image_of(&data, &media, &deflate_handle(false), 2).unwrap();

    let handles: Vec<_> = (0u64..4)
        .map(|i| {
            let mut reader = table.clone_for_read();
            let data = Arc::clone(&data);
            std::thread::spawn(move || {
                let mut out = vec![0u8; 25_000];
                let offset = i * 25_000;
                let read = reader.read_at(offset, &mut out).unwrap();
                assert_eq!(&out[..read], &data[offset as usize..offset as usize + read]);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

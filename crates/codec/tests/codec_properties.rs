//! Property tests for the codec invariants.

use std::io::Cursor;

use proptest::prelude::*;

use codec::{
    apply_delta, block_length_for, encode_delta, ChunkCompressor, ChunkDecompressor,
    CompressionAlgorithm,
};

fn compress_round_trip(algorithm: CompressionAlgorithm, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut encoder = ChunkCompressor::begin(algorithm, data.len() as u64);
    let mut stream = Vec::new();
    encoder.feed(data, &mut stream).expect("compress");
    encoder.finish(&mut stream);

    let mut decoder = ChunkDecompressor::begin(algorithm);
    let mut out = Vec::new();
    decoder.feed(&stream, &mut out).expect("decompress");
    decoder.verify_finished().expect("terminated");
    (stream, out)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn compression_round_trips_and_never_explodes(data in prop::collection::vec(any::<u8>(), 0..64 * 1024)) {
        for algorithm in [CompressionAlgorithm::default_zstd(), CompressionAlgorithm::Lz4] {
            let (stream, out) = compress_round_trip(algorithm, &data);
            prop_assert_eq!(&out, &data);
            // Worst case: incompressible input still stays within the
            // backend bound plus framing, comfortably under +1% + constant.
            let ceiling = data.len() + data.len() / 100 + 512;
            prop_assert!(stream.len() <= ceiling, "{} > {}", stream.len(), ceiling);
        }
    }

    #[test]
    fn delta_reconstructs_any_pair(
        reference in prop::collection::vec(any::<u8>(), 0..16 * 1024),
        target in prop::collection::vec(any::<u8>(), 0..16 * 1024),
    ) {
        let stream = encode_delta(reference.as_slice(), reference.len() as u64, &target)
            .expect("encode");
        let block = block_length_for(reference.len() as u64) as usize;
        let mut out = Vec::new();
        apply_delta(Cursor::new(&reference), block, &stream, &mut out).expect("apply");
        prop_assert_eq!(out, target);
    }

    #[test]
    fn delta_of_shared_prefix_pairs_reconstructs(
        shared in prop::collection::vec(any::<u8>(), 0..8192),
        suffix_a in prop::collection::vec(any::<u8>(), 0..2048),
        suffix_b in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let mut reference = shared.clone();
        reference.extend_from_slice(&suffix_a);
        let mut target = shared;
        target.extend_from_slice(&suffix_b);

        let stream = encode_delta(reference.as_slice(), reference.len() as u64, &target)
            .expect("encode");
        let block = block_length_for(reference.len() as u64) as usize;
        let mut out = Vec::new();
        apply_delta(Cursor::new(&reference), block, &stream, &mut out).expect("apply");
        prop_assert_eq!(out, target);
    }
}

//! Delta codec against a reference file.
//!
//! The exchange is split so the reference never crosses the wire: the side
//! holding the reference generates a [`FileSignature`] (weak + strong
//! checksums per block) and ships it to the side holding the target; that
//! side scans the target through a [`DeltaGenerator`] and ships back a
//! token stream, which a [`DeltaApplier`] replays against the local
//! reference to reconstruct the target byte for byte.
//!
//! The invariant `apply(reference, generate(signature(reference), target))
//! == target` holds for every file pair; a corrupt or truncated token
//! stream surfaces as a [`CodecError`](crate::CodecError) and is fatal to
//! the session that carried it.

mod apply;
mod generate;
mod index;
mod rolling;
mod signature;

pub use apply::DeltaApplier;
pub use generate::DeltaGenerator;
pub use index::DeltaIndex;
pub use rolling::RollingChecksum;
pub use signature::{block_length_for, strong_digest, BlockSum, FileSignature};

use std::io::{Read, Seek, Write};

use crate::error::CodecResult;

/// One-shot delta encode: signature from `reference`, token stream for
/// `target`. Used by tests and local reconstruction paths.
pub fn encode_delta(reference: impl Read, reference_len: u64, target: &[u8]) -> CodecResult<Vec<u8>> {
    let signature = FileSignature::generate(reference, reference_len)?;
    let index = DeltaIndex::from_signature(&signature);
    let mut generator = DeltaGenerator::begin(index);
    let mut stream = Vec::new();
    generator.feed(target, &mut stream);
    generator.finish(&mut stream);
    Ok(stream)
}

/// One-shot delta apply: replays `stream` against `basis` into `out`.
/// Returns the number of bytes written.
pub fn apply_delta(
    basis: impl Read + Seek,
    block_length: usize,
    stream: &[u8],
    out: &mut impl Write,
) -> CodecResult<u64> {
    let mut applier = DeltaApplier::begin(basis, block_length);
    let written = applier.feed(stream, out)?;
    applier.verify_finished()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(reference: &[u8], target: &[u8]) -> Vec<u8> {
        let stream = encode_delta(reference, reference.len() as u64, target).expect("encode");
        let block = block_length_for(reference.len() as u64) as usize;
        let mut out = Vec::new();
        apply_delta(Cursor::new(reference), block, &stream, &mut out).expect("apply");
        out
    }

    #[test]
    fn similar_files_reconstruct_with_a_small_delta() {
        let reference: Vec<u8> = (0..200_000u32).map(|i| (i % 249) as u8).collect();
        let mut target = reference.clone();
        // A localized edit: overwrite 1 KiB in the middle.
        for byte in &mut target[100_000..101_024] {
            *byte = 0xEE;
        }

        let stream = encode_delta(reference.as_slice(), reference.len() as u64, &target)
            .expect("encode");
        assert!(
            stream.len() < target.len() / 10,
            "delta of a 0.5% edit should be far smaller than the file, got {}",
            stream.len()
        );

        let block = block_length_for(reference.len() as u64) as usize;
        let mut out = Vec::new();
        apply_delta(Cursor::new(&reference), block, &stream, &mut out).expect("apply");
        assert_eq!(out, target);
    }

    #[test]
    fn empty_and_tiny_edges_round_trip() {
        assert_eq!(round_trip(b"", b""), b"");
        assert_eq!(round_trip(b"", b"fresh"), b"fresh");
        assert_eq!(round_trip(b"only reference", b""), b"");
        assert_eq!(round_trip(b"abc", b"abcabc"), b"abcabc");
    }

    #[test]
    fn corrupted_stream_is_fatal() {
        let reference: Vec<u8> = (0..8192u32).map(|i| (i % 247) as u8).collect();
        let target = reference.clone();
        let mut stream =
            encode_delta(reference.as_slice(), reference.len() as u64, &target).expect("encode");
        stream[0] = 0x7e; // Unknown token tag.

        let block = block_length_for(reference.len() as u64) as usize;
        let mut out = Vec::new();
        assert!(apply_delta(Cursor::new(&reference), block, &stream, &mut out).is_err());
    }

    #[test]
    fn truncated_stream_is_fatal() {
        let reference: Vec<u8> = (0..8192u32).map(|i| (i % 247) as u8).collect();
        let mut stream =
            encode_delta(reference.as_slice(), reference.len() as u64, &reference)
                .expect("encode");
        stream.truncate(stream.len() - 1);

        let block = block_length_for(reference.len() as u64) as usize;
        let mut applier = DeltaApplier::begin(Cursor::new(&reference), block);
        let mut out = Vec::new();
        applier.feed(&stream, &mut out).expect("partial feed is fine");
        assert!(applier.verify_finished().is_err());
    }
}

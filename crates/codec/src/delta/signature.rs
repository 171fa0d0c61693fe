//! Block signatures of a reference file.
//!
//! The receiver of a delta keeps the reference; the sender only needs this
//! signature: one weak rolling checksum and one strong digest per block.
//! Signatures are small (20 bytes per block against block sizes that grow
//! with the square root of the file), so shipping one across the wire costs
//! far less than shipping the reference.

use std::io::Read;

use xxhash_rust::xxh3::xxh3_128_with_seed;

use crate::error::{CodecError, CodecResult};

use super::rolling::RollingChecksum;

/// Seed for the strong per-block digest. Fixed so both ends agree.
const STRONG_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Smallest and largest block sizes the layout will pick.
const MIN_BLOCK: u64 = 700;
const MAX_BLOCK: u64 = 128 * 1024;

/// Picks the block length for a file of `file_len` bytes: fixed for small
/// files, then growing with the square root of the length, rounded to a
/// multiple of eight and clamped.
#[must_use]
pub fn block_length_for(file_len: u64) -> u32 {
    if file_len <= MIN_BLOCK * MIN_BLOCK {
        return MIN_BLOCK as u32;
    }
    let root = (file_len as f64).sqrt() as u64;
    let rounded = (root + 7) & !7;
    rounded.clamp(MIN_BLOCK, MAX_BLOCK) as u32
}

/// Strong digest of one block.
#[must_use]
pub fn strong_digest(block: &[u8]) -> [u8; 16] {
    xxh3_128_with_seed(block, STRONG_SEED).to_be_bytes()
}

/// Weak and strong checksums of one reference block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockSum {
    /// Packed rolling checksum.
    pub rolling: u32,
    /// Strong digest confirming a weak hit.
    pub strong: [u8; 16],
}

/// Signature of a whole reference file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileSignature {
    block_length: u32,
    file_length: u64,
    blocks: Vec<BlockSum>,
}

impl FileSignature {
    /// Block length every full block covers; the final block may be short.
    #[must_use]
    pub fn block_length(&self) -> u32 {
        self.block_length
    }

    /// Length of the reference file the signature describes.
    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Per-block checksums in file order.
    #[must_use]
    pub fn blocks(&self) -> &[BlockSum] {
        &self.blocks
    }

    /// Computes the signature of `reader`, which must yield exactly
    /// `file_length` bytes.
    pub fn generate(mut reader: impl Read, file_length: u64) -> CodecResult<Self> {
        let block_length = block_length_for(file_length);
        let mut blocks = Vec::new();
        let mut block = vec![0u8; block_length as usize];

        let mut remaining = file_length;
        while remaining > 0 {
            let want = remaining.min(u64::from(block_length)) as usize;
            reader.read_exact(&mut block[..want])?;
            blocks.push(BlockSum {
                rolling: RollingChecksum::of_block(&block[..want]),
                strong: strong_digest(&block[..want]),
            });
            remaining -= want as u64;
        }

        Ok(Self {
            block_length,
            file_length,
            blocks,
        })
    }

    /// Serializes for the wire.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.blocks.len() * 20);
        out.extend_from_slice(&self.block_length.to_be_bytes());
        out.extend_from_slice(&self.file_length.to_be_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_be_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&block.rolling.to_be_bytes());
            out.extend_from_slice(&block.strong);
        }
        out
    }

    /// Deserializes a wire signature.
    pub fn from_bytes(data: &[u8]) -> CodecResult<Self> {
        if data.len() < 16 {
            return Err(CodecError::Truncated);
        }
        let block_length = u32::from_be_bytes(data[0..4].try_into().expect("slice of 4"));
        let file_length = u64::from_be_bytes(data[4..12].try_into().expect("slice of 8"));
        let count = u32::from_be_bytes(data[12..16].try_into().expect("slice of 4")) as usize;

        if block_length == 0 {
            return Err(CodecError::Corrupt("zero block length"));
        }
        let body = &data[16..];
        if body.len() != count * 20 {
            return Err(CodecError::Truncated);
        }

        let mut blocks = Vec::with_capacity(count);
        for chunk in body.chunks_exact(20) {
            let rolling = u32::from_be_bytes(chunk[0..4].try_into().expect("slice of 4"));
            let mut strong = [0u8; 16];
            strong.copy_from_slice(&chunk[4..20]);
            blocks.push(BlockSum { rolling, strong });
        }
        Ok(Self {
            block_length,
            file_length,
            blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_grows_with_the_square_root() {
        assert_eq!(block_length_for(1000), 700);
        assert_eq!(block_length_for(MIN_BLOCK * MIN_BLOCK), 700);
        let mid = block_length_for(100 * 1024 * 1024);
        assert!(mid > 700 && mid < MAX_BLOCK as u32);
        assert_eq!(mid % 8, 0);
        assert_eq!(block_length_for(u64::MAX / 2), MAX_BLOCK as u32);
    }

    #[test]
    fn signature_round_trips_through_bytes() {
        let data: Vec<u8> = (0..5000u16).map(|i| (i % 256) as u8).collect();
        let signature =
            FileSignature::generate(data.as_slice(), data.len() as u64).expect("signature");
        assert_eq!(signature.block_length(), 700);
        assert_eq!(signature.blocks().len(), 8); // ceil(5000 / 700)

        let restored = FileSignature::from_bytes(&signature.to_bytes()).expect("decode");
        assert_eq!(restored, signature);
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let data = vec![1u8; 2000];
        let signature =
            FileSignature::generate(data.as_slice(), data.len() as u64).expect("signature");
        let mut bytes = signature.to_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(FileSignature::from_bytes(&bytes).is_err());
    }
}

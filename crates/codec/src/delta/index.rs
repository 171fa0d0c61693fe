//! Fast lookup over a reference signature.

use std::collections::HashMap;

use super::signature::{strong_digest, FileSignature};

/// Signature index keyed on the weak rolling checksum, with strong
/// confirmation on hit. Only full-length blocks participate in matching;
/// a short trailing block is cheaper to resend as literal than to index.
#[derive(Debug)]
pub struct DeltaIndex {
    block_length: usize,
    file_length: u64,
    by_rolling: HashMap<u32, Vec<u32>>,
    strong: Vec<[u8; 16]>,
}

impl DeltaIndex {
    /// Builds the index from a signature.
    #[must_use]
    pub fn from_signature(signature: &FileSignature) -> Self {
        let block_length = signature.block_length() as usize;
        let full_blocks = (signature.file_length() / signature.block_length() as u64) as usize;

        let mut by_rolling: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut strong = Vec::with_capacity(signature.blocks().len());
        for (i, block) in signature.blocks().iter().enumerate() {
            strong.push(block.strong);
            if i < full_blocks {
                by_rolling.entry(block.rolling).or_default().push(i as u32);
            }
        }
        Self {
            block_length,
            file_length: signature.file_length(),
            by_rolling,
            strong,
        }
    }

    /// Block length of the underlying signature.
    #[must_use]
    pub fn block_length(&self) -> usize {
        self.block_length
    }

    /// Length of the reference file.
    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Number of indexed blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.strong.len()
    }

    /// Finds the block matching `window`, confirming weak hits with the
    /// strong digest. Returns the block index.
    #[must_use]
    pub fn find(&self, rolling: u32, window: &[u8]) -> Option<u32> {
        let candidates = self.by_rolling.get(&rolling)?;
        let digest = strong_digest(window);
        candidates
            .iter()
            .copied()
            .find(|&i| self.strong[i as usize] == digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::rolling::RollingChecksum;

    #[test]
    fn find_confirms_with_the_strong_digest() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let signature =
            FileSignature::generate(data.as_slice(), data.len() as u64).expect("signature");
        let index = DeltaIndex::from_signature(&signature);

        let block_len = index.block_length();
        let window = &data[block_len..2 * block_len];
        let rolling = RollingChecksum::of_block(window);
        assert_eq!(index.find(rolling, window), Some(1));

        // Same weak sum, different bytes: rejected by the strong digest.
        let mut fake = window.to_vec();
        let last = fake.len() - 1;
        fake[0] = fake[0].wrapping_add(1);
        fake[last] = fake[last].wrapping_sub(1);
        if RollingChecksum::of_block(&fake) == rolling {
            assert_eq!(index.find(rolling, &fake), None);
        }
    }
}

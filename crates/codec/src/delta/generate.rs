//! Delta generation against a reference signature.
//!
//! The generator scans the target stream with a rolling window of one block
//! length. A weak-checksum hit confirmed by the strong digest becomes a
//! `copy` token referencing the matched reference block; bytes that match
//! nothing accumulate and flush as `literal` tokens. The sender never needs
//! the reference file itself, only its signature.

use super::index::DeltaIndex;
use super::rolling::RollingChecksum;

/// Token stream tags.
pub(super) const TOKEN_LITERAL: u8 = 0x00;
pub(super) const TOKEN_COPY: u8 = 0x01;
pub(super) const TOKEN_END: u8 = 0xff;

/// Longest literal run buffered before it is flushed as one token.
const MAX_LITERAL_RUN: usize = 1 << 20;

/// Streaming delta encoder.
pub struct DeltaGenerator {
    index: DeltaIndex,
    buffer: Vec<u8>,
    cursor: usize,
    rolling: RollingChecksum,
    window_valid: bool,
    finished: bool,
    total_bytes: u64,
    literal_bytes: u64,
    copy_bytes: u64,
}

impl DeltaGenerator {
    /// Begins encoding against `index`.
    #[must_use]
    pub fn begin(index: DeltaIndex) -> Self {
        Self {
            index,
            buffer: Vec::new(),
            cursor: 0,
            rolling: RollingChecksum::new(),
            window_valid: false,
            finished: false,
            total_bytes: 0,
            literal_bytes: 0,
            copy_bytes: 0,
        }
    }

    /// Consumes target bytes, appending serialized tokens to `out`.
    /// Returns the number of bytes appended; zero is normal while the
    /// window is filling.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> usize {
        debug_assert!(!self.finished, "feed after finish");
        let before = out.len();
        self.buffer.extend_from_slice(input);
        self.total_bytes += input.len() as u64;
        self.scan(out);
        out.len() - before
    }

    /// Flushes the tail as a literal and terminates the stream. Returns the
    /// number of trailer bytes appended.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> usize {
        let before = out.len();
        self.finished = true;
        let tail = std::mem::take(&mut self.buffer);
        self.literal_bytes += tail.len() as u64;
        push_literal(out, &tail);
        out.push(TOKEN_END);
        self.cursor = 0;
        out.len() - before
    }

    /// Total target bytes consumed.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes emitted as literals.
    #[must_use]
    pub fn literal_bytes(&self) -> u64 {
        self.literal_bytes
    }

    /// Bytes satisfied from the reference.
    #[must_use]
    pub fn copy_bytes(&self) -> u64 {
        self.copy_bytes
    }

    fn scan(&mut self, out: &mut Vec<u8>) {
        let block = self.index.block_length();
        if block == 0 {
            return;
        }
        loop {
            if self.buffer.len() - self.cursor < block {
                break;
            }
            if !self.window_valid {
                self.rolling
                    .reset_to_block(&self.buffer[self.cursor..self.cursor + block]);
                self.window_valid = true;
            }

            let window = &self.buffer[self.cursor..self.cursor + block];
            if let Some(matched) = self.index.find(self.rolling.value(), window) {
                self.literal_bytes += self.cursor as u64;
                push_literal(out, &self.buffer[..self.cursor]);
                push_copy(out, matched, block as u32);
                self.copy_bytes += block as u64;
                self.buffer.drain(..self.cursor + block);
                self.cursor = 0;
                self.window_valid = false;
                continue;
            }

            if self.buffer.len() - self.cursor == block {
                // Cannot roll without the next byte.
                break;
            }
            let outgoing = self.buffer[self.cursor];
            let incoming = self.buffer[self.cursor + block];
            self.rolling.roll(outgoing, incoming);
            self.cursor += 1;

            if self.cursor >= MAX_LITERAL_RUN {
                self.literal_bytes += self.cursor as u64;
                push_literal(out, &self.buffer[..self.cursor]);
                self.buffer.drain(..self.cursor);
                self.cursor = 0;
                // The rolling state still describes the same window bytes.
            }
        }
    }
}

fn push_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    for chunk in bytes.chunks(MAX_LITERAL_RUN) {
        if chunk.is_empty() {
            continue;
        }
        out.push(TOKEN_LITERAL);
        out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk);
    }
}

fn push_copy(out: &mut Vec<u8>, block_index: u32, len: u32) {
    out.push(TOKEN_COPY);
    out.extend_from_slice(&u64::from(block_index).to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::signature::FileSignature;

    #[test]
    fn identical_target_is_all_copies() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 253) as u8).collect();
        let signature =
            FileSignature::generate(data.as_slice(), data.len() as u64).expect("signature");
        let index = DeltaIndex::from_signature(&signature);
        let block = index.block_length();

        let mut generator = DeltaGenerator::begin(index);
        let mut stream = Vec::new();
        generator.feed(&data, &mut stream);
        generator.finish(&mut stream);

        let full_blocks = (data.len() / block) as u64;
        assert_eq!(generator.copy_bytes(), full_blocks * block as u64);
        assert_eq!(
            generator.literal_bytes(),
            data.len() as u64 - generator.copy_bytes()
        );
    }

    #[test]
    fn unrelated_target_is_all_literal() {
        let reference = vec![0u8; 4096];
        let target: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let signature =
            FileSignature::generate(reference.as_slice(), reference.len() as u64)
                .expect("signature");
        let mut generator = DeltaGenerator::begin(DeltaIndex::from_signature(&signature));
        let mut stream = Vec::new();
        generator.feed(&target, &mut stream);
        generator.finish(&mut stream);

        // All-zero reference blocks share one rolling value; the strong
        // digest rejects every candidate for this target.
        assert_eq!(generator.copy_bytes(), 0);
        assert_eq!(generator.literal_bytes(), target.len() as u64);
    }
}

//! Delta application against a local basis file.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{CodecError, CodecResult};

use super::generate::{TOKEN_COPY, TOKEN_END, TOKEN_LITERAL};

/// Streaming delta decoder.
///
/// Input may arrive in arbitrary slices; complete tokens are applied as
/// soon as they assemble. `copy` tokens are satisfied from the basis via
/// seek + read, so the basis never has to fit in memory.
pub struct DeltaApplier<B> {
    basis: B,
    block_length: u64,
    pending: Vec<u8>,
    scratch: Vec<u8>,
    finished: bool,
    written: u64,
}

impl<B: Read + Seek> DeltaApplier<B> {
    /// Begins decoding against `basis`, whose signature used `block_length`.
    #[must_use]
    pub fn begin(basis: B, block_length: usize) -> Self {
        Self {
            basis,
            block_length: block_length as u64,
            pending: Vec::new(),
            scratch: vec![0u8; block_length.max(1)],
            finished: false,
            written: 0,
        }
    }

    /// Consumes delta-stream bytes, writing reconstructed output to `out`.
    /// Returns the number of output bytes produced by this call.
    pub fn feed(&mut self, input: &[u8], out: &mut impl Write) -> CodecResult<u64> {
        if self.finished && !input.is_empty() {
            return Err(CodecError::Corrupt("data after delta terminator"));
        }
        self.pending.extend_from_slice(input);
        let before = self.written;

        loop {
            let Some(&tag) = self.pending.first() else {
                break;
            };
            match tag {
                TOKEN_LITERAL => {
                    if self.pending.len() < 5 {
                        break;
                    }
                    let len = u32::from_be_bytes(
                        self.pending[1..5].try_into().expect("slice of 4"),
                    ) as usize;
                    if len == 0 {
                        return Err(CodecError::Corrupt("empty literal token"));
                    }
                    if self.pending.len() < 5 + len {
                        break;
                    }
                    out.write_all(&self.pending[5..5 + len])?;
                    self.written += len as u64;
                    self.pending.drain(..5 + len);
                }
                TOKEN_COPY => {
                    if self.pending.len() < 13 {
                        break;
                    }
                    let block_index = u64::from_be_bytes(
                        self.pending[1..9].try_into().expect("slice of 8"),
                    );
                    let len = u32::from_be_bytes(
                        self.pending[9..13].try_into().expect("slice of 4"),
                    ) as u64;
                    if len == 0 || len > self.block_length {
                        return Err(CodecError::Corrupt("copy length out of range"));
                    }
                    let offset = block_index
                        .checked_mul(self.block_length)
                        .ok_or(CodecError::Corrupt("copy offset overflow"))?;

                    self.basis.seek(SeekFrom::Start(offset))?;
                    let chunk = &mut self.scratch[..len as usize];
                    self.basis
                        .read_exact(chunk)
                        .map_err(|_| CodecError::ReferenceMismatch("basis too short"))?;
                    out.write_all(chunk)?;
                    self.written += len;
                    self.pending.drain(..13);
                }
                TOKEN_END => {
                    if self.pending.len() > 1 {
                        return Err(CodecError::Corrupt("data after delta terminator"));
                    }
                    self.pending.clear();
                    self.finished = true;
                }
                _ => return Err(CodecError::Corrupt("unknown delta token")),
            }
        }

        Ok(self.written - before)
    }

    /// Returns `true` once the terminator token has been consumed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Verifies the stream terminated cleanly.
    pub fn verify_finished(&self) -> CodecResult<()> {
        if self.finished && self.pending.is_empty() {
            Ok(())
        } else {
            Err(CodecError::Truncated)
        }
    }

    /// Total output bytes produced.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

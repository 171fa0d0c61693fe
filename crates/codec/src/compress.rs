//! Chunk-framed streaming compression.
//!
//! The encoder splits its input into chunks bounded by
//! [`MAX_CHUNK_PAYLOAD`], compresses each chunk on its own and emits
//! `u32`-big-endian length-prefixed frames; a zero-length frame terminates
//! the stream. Because every frame is self-contained the decoder tolerates
//! chunk boundaries that differ from the encoder's and can resume at any
//! frame edge, which is what lets bulk frames travel inside arbitrary
//! transport messages.

use crate::error::{CodecError, CodecResult};

/// Maximum raw payload per compressed chunk. A quarter of the 8 MiB copy
/// buffer, minus headroom for the compressor's worst-case bound, so one
/// context buffer can stage both the raw and the compressed chunk.
pub const MAX_CHUNK_PAYLOAD: usize = 2 * 1024 * 1024 - 32 * 1024;

/// Compression algorithm negotiated per session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionAlgorithm {
    /// Zstandard at a given level. The level may be retuned between chunks.
    Zstd {
        /// Compression level, `1..=19`.
        level: i32,
    },
    /// LZ4 block compression for latency-bound links.
    Lz4,
}

impl CompressionAlgorithm {
    /// Default Zstandard level.
    pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

    /// Default algorithm used when compression is negotiated.
    #[must_use]
    pub const fn default_zstd() -> Self {
        Self::Zstd {
            level: Self::DEFAULT_ZSTD_LEVEL,
        }
    }

    /// Wire identifier carried in the negotiation envelope.
    #[must_use]
    pub const fn wire_id(self) -> u8 {
        match self {
            Self::Zstd { .. } => 1,
            Self::Lz4 => 2,
        }
    }

    /// Decodes a wire identifier.
    #[must_use]
    pub const fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::default_zstd()),
            2 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// Streaming chunk encoder.
pub struct ChunkCompressor {
    algorithm: CompressionAlgorithm,
    raw_in: u64,
    emitted: u64,
}

impl ChunkCompressor {
    /// Begins an encode stream. `target_size` is advisory and reserved for
    /// future dictionary priming; pass the file size when known.
    #[must_use]
    pub fn begin(algorithm: CompressionAlgorithm, _target_size: u64) -> Self {
        Self {
            algorithm,
            raw_in: 0,
            emitted: 0,
        }
    }

    /// Compresses `input`, appending zero or more framed chunks to `out`.
    /// Returns the number of bytes appended.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> CodecResult<usize> {
        let before = out.len();
        for chunk in input.chunks(MAX_CHUNK_PAYLOAD) {
            let compressed = match self.algorithm {
                CompressionAlgorithm::Zstd { level } => zstd::bulk::compress(chunk, level)
                    .map_err(|_| CodecError::Corrupt("zstd compression failed"))?,
                CompressionAlgorithm::Lz4 => lz4_flex::block::compress_prepend_size(chunk),
            };
            let len = u32::try_from(compressed.len())
                .map_err(|_| CodecError::Corrupt("chunk exceeds frame size"))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&compressed);
            self.raw_in += chunk.len() as u64;
        }
        let appended = out.len() - before;
        self.emitted += appended as u64;
        Ok(appended)
    }

    /// Terminates the stream with a zero-length frame. Returns the number
    /// of trailer bytes appended.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> usize {
        out.extend_from_slice(&0u32.to_be_bytes());
        self.emitted += 4;
        4
    }

    /// Retunes the level between chunks; ignored for algorithms without one.
    pub fn set_level(&mut self, level: i32) {
        if let CompressionAlgorithm::Zstd { level: current } = &mut self.algorithm {
            *current = level.clamp(1, 19);
        }
    }

    /// Raw bytes consumed so far.
    #[must_use]
    pub fn raw_bytes(&self) -> u64 {
        self.raw_in
    }

    /// Framed bytes emitted so far.
    #[must_use]
    pub fn emitted_bytes(&self) -> u64 {
        self.emitted
    }
}

/// Worst-case frame payload the decoder will accept.
fn max_frame_payload() -> usize {
    // Covers both backends: zstd's bound and lz4's size-prepended block.
    MAX_CHUNK_PAYLOAD + MAX_CHUNK_PAYLOAD / 128 + 1024
}

/// Streaming chunk decoder.
///
/// Input may arrive in arbitrary slices; frames are reassembled internally
/// and decompressed as soon as they complete.
pub struct ChunkDecompressor {
    algorithm: CompressionAlgorithm,
    pending: Vec<u8>,
    finished: bool,
    raw_out: u64,
}

impl ChunkDecompressor {
    /// Begins a decode stream.
    #[must_use]
    pub fn begin(algorithm: CompressionAlgorithm) -> Self {
        Self {
            algorithm,
            pending: Vec::new(),
            finished: false,
            raw_out: 0,
        }
    }

    /// Consumes `input`, appending decompressed bytes to `out`. Returns the
    /// number of bytes appended.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> CodecResult<usize> {
        if self.finished && !input.is_empty() {
            return Err(CodecError::Corrupt("data after stream terminator"));
        }
        self.pending.extend_from_slice(input);
        let before = out.len();

        loop {
            if self.pending.len() < 4 {
                break;
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&self.pending[..4]);
            let frame_len = u32::from_be_bytes(len_bytes) as usize;
            if frame_len == 0 {
                if self.pending.len() > 4 {
                    return Err(CodecError::Corrupt("data after stream terminator"));
                }
                self.pending.clear();
                self.finished = true;
                break;
            }
            if frame_len > max_frame_payload() {
                return Err(CodecError::Corrupt("frame length out of range"));
            }
            if self.pending.len() < 4 + frame_len {
                break;
            }

            let frame = &self.pending[4..4 + frame_len];
            let raw = match self.algorithm {
                CompressionAlgorithm::Zstd { .. } => {
                    zstd::bulk::decompress(frame, MAX_CHUNK_PAYLOAD)
                        .map_err(|_| CodecError::Corrupt("zstd decompression failed"))?
                }
                CompressionAlgorithm::Lz4 => lz4_flex::block::decompress_size_prepended(frame)
                    .map_err(|_| CodecError::Corrupt("lz4 decompression failed"))?,
            };
            if raw.len() > MAX_CHUNK_PAYLOAD {
                return Err(CodecError::Corrupt("chunk payload out of range"));
            }
            out.extend_from_slice(&raw);
            self.raw_out += raw.len() as u64;
            self.pending.drain(..4 + frame_len);
        }

        Ok(out.len() - before)
    }

    /// Returns `true` once the terminator frame has been consumed.
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

    /// Raw bytes produced so far.
    #[must_use]
    pub fn raw_bytes(&self) -> u64 {
        self.raw_out
    }
}

/// Feedback controller that retunes the Zstandard level from observed send
/// throughput: when the wire is the bottleneck, spending more CPU on
/// compression is free; when compression is the bottleneck, back off.
#[derive(Debug)]
pub struct CompressionGovernor {
    level: i32,
    fixed: bool,
    last_wire_ratio: Option<f64>,
}

impl CompressionGovernor {
    /// Creates a governor starting at `level`. A `fixed` governor never
    /// retunes.
    #[must_use]
    pub fn new(level: i32, fixed: bool) -> Self {
        Self {
            level: level.clamp(1, 19),
            fixed,
            last_wire_ratio: None,
        }
    }

    /// Current level.
    #[must_use]
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Observes one send: `wire_bytes` took `wire_nanos` on the socket while
    /// `compress_nanos` was spent producing them. Returns the level to use
    /// for the next chunk.
    pub fn observe(&mut self, wire_bytes: u64, wire_nanos: u64, compress_nanos: u64) -> i32 {
        if self.fixed || wire_bytes == 0 || wire_nanos == 0 {
            return self.level;
        }
        let wire_ratio = wire_nanos as f64 / wire_bytes as f64;
        if compress_nanos < wire_nanos {
            // The socket dominates: try harder.
            self.level = (self.level + 1).min(19);
        } else if let Some(last) = self.last_wire_ratio {
            // Compression dominates and the wire did not get slower: ease off.
            if wire_ratio <= last {
                self.level = (self.level - 1).max(1);
            }
        }
        self.last_wire_ratio = Some(wire_ratio);
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(algorithm: CompressionAlgorithm, data: &[u8]) -> Vec<u8> {
        let mut encoder = ChunkCompressor::begin(algorithm, data.len() as u64);
        let mut stream = Vec::new();
        // Feed in uneven slices to exercise chunk splitting.
        for piece in data.chunks(7 * 1024 + 13) {
            encoder.feed(piece, &mut stream).expect("feed");
        }
        encoder.finish(&mut stream);

        let mut decoder = ChunkDecompressor::begin(algorithm);
        let mut out = Vec::new();
        // Hand the stream back in slices that do not line up with frames.
        for piece in stream.chunks(4097) {
            decoder.feed(piece, &mut out).expect("decode");
        }
        decoder.verify_finished().expect("terminated");
        out
    }

    #[test]
    fn zstd_round_trips_across_mismatched_boundaries() {
        let data: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        assert_eq!(round_trip(CompressionAlgorithm::default_zstd(), &data), data);
    }

    #[test]
    fn lz4_round_trips() {
        let data = vec![42u8; 50_000];
        assert_eq!(round_trip(CompressionAlgorithm::Lz4, &data), data);
    }

    #[test]
    fn empty_stream_is_just_a_terminator() {
        let mut encoder = ChunkCompressor::begin(CompressionAlgorithm::default_zstd(), 0);
        let mut stream = Vec::new();
        encoder.feed(&[], &mut stream).expect("feed");
        assert_eq!(encoder.finish(&mut stream), 4);
        assert_eq!(stream, 0u32.to_be_bytes());

        let mut decoder = ChunkDecompressor::begin(CompressionAlgorithm::default_zstd());
        let mut out = Vec::new();
        decoder.feed(&stream, &mut out).expect("decode");
        assert!(out.is_empty());
        assert!(decoder.is_finished());
    }

    #[test]
    fn corrupt_frame_is_rejected() {
        let mut encoder = ChunkCompressor::begin(CompressionAlgorithm::default_zstd(), 0);
        let mut stream = Vec::new();
        encoder.feed(b"some payload to mangle", &mut stream).expect("feed");
        encoder.finish(&mut stream);
        stream[6] ^= 0xff;

        let mut decoder = ChunkDecompressor::begin(CompressionAlgorithm::default_zstd());
        let mut out = Vec::new();
        assert!(decoder.feed(&stream, &mut out).is_err());
    }

    #[test]
    fn truncated_stream_fails_verification() {
        let mut encoder = ChunkCompressor::begin(CompressionAlgorithm::default_zstd(), 0);
        let mut stream = Vec::new();
        encoder.feed(b"payload", &mut stream).expect("feed");
        // No terminator.
        let mut decoder = ChunkDecompressor::begin(CompressionAlgorithm::default_zstd());
        let mut out = Vec::new();
        decoder.feed(&stream, &mut out).expect("decode");
        assert!(decoder.verify_finished().is_err());
    }

    #[test]
    fn governor_raises_level_when_the_wire_dominates() {
        let mut governor = CompressionGovernor::new(3, false);
        let level = governor.observe(1_000_000, 10_000_000, 1_000_000);
        assert_eq!(level, 4);

        let mut fixed = CompressionGovernor::new(9, true);
        assert_eq!(fixed.observe(1_000_000, 10_000_000, 1_000_000), 9);
    }
}

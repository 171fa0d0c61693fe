#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `codec` hosts the two transforms the EACopy wire protocol layers over
//! its bulk transfers: chunk-framed streaming compression and a delta codec
//! that reconstructs a file from a reference the receiver already holds.
//! Both are expressed as the same begin/feed/finish capability set with an
//! encode/decode pair per direction, so sessions drive either codec through
//! one shape of loop.
//!
//! # Design
//!
//! - [`compress`] splits input into bounded chunks, compresses each with
//!   the negotiated backend (Zstandard by default, LZ4 for latency-bound
//!   links) and frames them with a length prefix; a zero-length frame
//!   terminates. A [`CompressionGovernor`] can retune the Zstandard level
//!   between chunks from observed send throughput.
//! - [`delta`] is a block-matching pipeline: the reference side produces a
//!   compact [`FileSignature`]; the target side scans its file with a
//!   rolling checksum, confirms weak hits with a strong digest and emits
//!   copy/literal tokens; the reference side replays the tokens against the
//!   local basis file.
//!
//! # Invariants
//!
//! - `decompress(compress(x)) == x` for every byte sequence, and the framed
//!   stream never expands the input by more than the backend bound plus the
//!   per-chunk framing.
//! - `apply(reference, generate(signature(reference), target)) == target`
//!   byte for byte, for every file pair.
//! - Decoders tolerate input arriving at arbitrary boundaries.
//!
//! # Errors
//!
//! Corrupt streams, truncated input and reference mismatches surface as
//! [`CodecError`]. Any decode failure is fatal to the session that carried
//! the stream; the connection is torn down and the engine retries the file
//! on a fallback path.

pub mod compress;
pub mod delta;
pub mod error;

pub use compress::{
    ChunkCompressor, ChunkDecompressor, CompressionAlgorithm, CompressionGovernor,
    MAX_CHUNK_PAYLOAD,
};
pub use delta::{
    apply_delta, block_length_for, encode_delta, DeltaApplier, DeltaGenerator, DeltaIndex,
    FileSignature,
};
pub use error::{CodecError, CodecResult};

//! Codec error taxonomy.

use std::io;

use thiserror::Error;

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failure while encoding or decoding a stream.
///
/// Every decode failure is fatal to the session that carried the stream:
/// the connection is torn down and the client retries the file on a
/// fallback path.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream is structurally invalid: bad frame length, unknown token,
    /// trailing garbage or a backend decompression failure.
    #[error("corrupt stream: {0}")]
    Corrupt(&'static str),
    /// The stream ended before its terminator.
    #[error("truncated stream")]
    Truncated,
    /// A delta token referenced data the basis file does not have.
    #[error("delta reference mismatch: {0}")]
    ReferenceMismatch(&'static str),
    /// Underlying I/O failure while reading a basis file or writing output.
    #[error("codec I/O failure")]
    Io(#[from] io::Error),
}

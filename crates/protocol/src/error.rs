//! Protocol error taxonomy.

use std::io;

use thiserror::Error;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Failure while framing, parsing or sequencing protocol messages.
///
/// Every variant except `Io` indicates a peer that is not speaking this
/// protocol correctly; all of them are fatal to the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport failure.
    #[error("transport failure")]
    Io(#[from] io::Error),
    /// A frame carried a tag this build does not know.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    /// A frame length field is zero or exceeds the frame ceiling.
    #[error("frame length {0} out of range")]
    FrameLength(u32),
    /// A message body ended before its payload was complete.
    #[error("truncated message body")]
    Truncated,
    /// A message body carried bytes past its payload.
    #[error("trailing bytes in message body")]
    TrailingBytes,
    /// A wire string is not valid UTF-8.
    #[error("malformed string in message body")]
    BadString,
    /// A string field is too long for the 16-bit length prefix.
    #[error("string of {len} bytes exceeds the wire limit")]
    StringTooLong {
        /// Byte length of the offending string.
        len: usize,
    },
    /// A payload field held an invalid value.
    #[error("malformed payload: {0}")]
    BadPayload(&'static str),
    /// The peers do not share a protocol version.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Version this build speaks.
        ours: u32,
        /// Version the peer announced.
        theirs: u32,
    },
    /// A message arrived that the session state machine does not allow.
    #[error("message {message} not valid in session state {state}")]
    BadTransition {
        /// State the session was in.
        state: &'static str,
        /// Message that arrived.
        message: &'static str,
    },
    /// The peer reported a fatal error and the session is closing.
    #[error("peer error ({kind}): {message}")]
    Remote {
        /// Error kind from the wire.
        kind: crate::message::ErrKind,
        /// Peer-supplied description.
        message: String,
    },
}

impl ProtocolError {
    /// Returns `true` when the failure is a transport-level disconnect that
    /// the engine may recover from by reconnecting.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

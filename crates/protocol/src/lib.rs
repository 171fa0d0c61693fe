#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `protocol` defines the wire format spoken between the EACopy copy engine
//! and the copy server: length-prefixed framing, the message taxonomy from
//! session negotiation through bulk transfer to shutdown, the negotiated
//! feature flags and the session state machine both peers drive.
//!
//! # Design
//!
//! - [`wire`] owns the bit-exact byte layout: 4-byte big-endian length over
//!   tag and body, 1-byte tag, big-endian scalars, length-prefixed UTF-8
//!   strings, 16-byte fingerprints and low/high file-time halves.
//! - [`message`] gives each tag a typed payload with explicit encode and
//!   decode, so malformed input is rejected field by field and unknown tags
//!   are fatal.
//! - [`session`] is the pure transition table; sessions close on anything
//!   the table does not allow, without touching any database state.
//!
//! # Invariants
//!
//! - Within a session, messages are totally ordered by the transport; the
//!   state machine encodes the only legal orderings.
//! - Unknown tags, truncated frames and malformed lengths never panic;
//!   they surface as [`ProtocolError`] and close the session.
//! - Raw copy requires no negotiated feature; two peers that share nothing
//!   but the protocol version can still replicate.

pub mod error;
pub mod message;
pub mod session;
pub mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    Directive, ErrKind, FeatureFlags, Message, SendHints, ServerStats, Tag,
};
pub use session::{SessionEvent, SessionState};
pub use wire::{read_frame, write_frame, DEFAULT_PORT, MAX_FRAME, PROTOCOL_VERSION};

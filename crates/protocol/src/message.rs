//! The message taxonomy.
//!
//! One enum variant per wire tag. Encoding is explicit per message rather
//! than derived, so the byte layout stays bit-exact for compatibility and
//! malformed input is rejected field by field.

use std::fmt;
use std::io::{Read, Write};

use fileio::FileStamp;
use hashdb::{FileKey, Fingerprint};

use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::{read_frame, write_frame, BodyReader, BodyWriter};

/// Message tags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Tag {
    /// Session negotiation, client to server.
    Hello = 1,
    /// Negotiation reply, server to client.
    HelloAck = 2,
    /// Destination root for the session.
    Env = 3,
    /// Client wants to push a file.
    FileSend = 4,
    /// Server's decision on how the file should arrive.
    FileRecv = 5,
    /// Bulk payload chunk.
    Bytes = 6,
    /// End of bulk payload, with checksum.
    EndBytes = 7,
    /// Per-file completion.
    FileAck = 8,
    /// Register a directory for background priming.
    Prime = 9,
    /// End-of-session server counters.
    Stats = 10,
    /// Graceful shutdown.
    Bye = 11,
    /// Fatal error; the connection closes.
    Err = 12,
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            1 => Self::Hello,
            2 => Self::HelloAck,
            3 => Self::Env,
            4 => Self::FileSend,
            5 => Self::FileRecv,
            6 => Self::Bytes,
            7 => Self::EndBytes,
            8 => Self::FileAck,
            9 => Self::Prime,
            10 => Self::Stats,
            11 => Self::Bye,
            12 => Self::Err,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

/// Negotiated feature bits. Raw copy is always mutually supported and has
/// no bit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FeatureFlags(u8);

impl FeatureFlags {
    /// Compressed bulk transfers.
    pub const COMPRESSION: FeatureFlags = FeatureFlags(1);
    /// Delta transfers against server-side references.
    pub const DELTA: FeatureFlags = FeatureFlags(1 << 1);
    /// Secure-copy marker carried for compatibility; no cryptography is
    /// attached on trusted links.
    pub const SECURE_COPY: FeatureFlags = FeatureFlags(1 << 2);

    const ALL: u8 = 0b111;

    /// No features.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstructs from wire bits, dropping unknown ones.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    /// Set union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set intersection; used to grant the common feature set.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Membership test.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Removes `other` from the set.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// Client hints accompanying a `FileSend`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SendHints {
    /// The payload is expected to compress.
    pub compressible: bool,
    /// The client accepts a delta directive for this file.
    pub delta_ok: bool,
}

impl SendHints {
    fn bits(self) -> u8 {
        u8::from(self.compressible) | (u8::from(self.delta_ok) << 1)
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            compressible: bits & 1 != 0,
            delta_ok: bits & 2 != 0,
        }
    }
}

/// Server's decision on how a pushed file should travel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Directive {
    /// The server already had the content and satisfied the destination by
    /// hardlink; no bytes follow.
    AlreadyHave,
    /// Stream the raw bytes.
    SendRaw,
    /// Stream chunk-compressed bytes with the given algorithm id.
    SendCompressed {
        /// Compression algorithm wire id.
        algorithm: u8,
    },
    /// The server sends a signature of `reference`; the client answers with
    /// a delta token stream against it.
    SendDelta {
        /// Server-side reference file name.
        reference: String,
    },
}

impl Directive {
    fn encode(&self, body: &mut BodyWriter) -> ProtocolResult<()> {
        match self {
            Self::AlreadyHave => body.u8(0),
            Self::SendRaw => body.u8(1),
            Self::SendCompressed { algorithm } => {
                body.u8(2);
                body.u8(*algorithm);
            }
            Self::SendDelta { reference } => {
                body.u8(3);
                body.string(reference)?;
            }
        }
        Ok(())
    }

    fn decode(reader: &mut BodyReader<'_>) -> ProtocolResult<Self> {
        Ok(match reader.u8()? {
            0 => Self::AlreadyHave,
            1 => Self::SendRaw,
            2 => Self::SendCompressed {
                algorithm: reader.u8()?,
            },
            3 => Self::SendDelta {
                reference: reader.string()?,
            },
            _ => return Err(ProtocolError::BadPayload("unknown directive")),
        })
    }
}

/// Wire error kinds, mirroring the engine's failure taxonomy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ErrKind {
    /// Source file disappeared.
    SourceMissing = 1,
    /// Destination is busy; the peer may retry.
    DestinationBusy = 2,
    /// Access denied.
    AccessDenied = 3,
    /// Protocol violation.
    ProtocolViolation = 4,
    /// A codec stream failed to decode.
    CodecCorrupt = 5,
    /// Server database inconsistency; dedup and delta are degraded.
    DatabaseConsistency = 6,
    /// Out of disk space.
    DiskFull = 7,
    /// The peer cancelled the session.
    Cancelled = 8,
    /// Anything else.
    Other = 9,
}

impl ErrKind {
    fn from_wire(value: u8) -> Self {
        match value {
            1 => Self::SourceMissing,
            2 => Self::DestinationBusy,
            3 => Self::AccessDenied,
            4 => Self::ProtocolViolation,
            5 => Self::CodecCorrupt,
            6 => Self::DatabaseConsistency,
            7 => Self::DiskFull,
            8 => Self::Cancelled,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SourceMissing => "source-missing",
            Self::DestinationBusy => "destination-busy",
            Self::AccessDenied => "access-denied",
            Self::ProtocolViolation => "protocol-violation",
            Self::CodecCorrupt => "codec-corrupt",
            Self::DatabaseConsistency => "database-consistency",
            Self::DiskFull => "disk-full",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Server-side counters flushed at end of session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ServerStats {
    /// Files satisfied by hardlink or key match.
    pub files_linked: u64,
    /// Files received as deltas.
    pub files_delta: u64,
    /// Files received compressed.
    pub files_compressed: u64,
    /// Files received raw.
    pub files_raw: u64,
    /// Bulk payload bytes that crossed the wire.
    pub wire_bytes: u64,
    /// Rows in the content database.
    pub db_rows: u64,
}

/// One protocol message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Session negotiation.
    Hello {
        /// Client protocol version.
        version: u32,
        /// Features the client offers.
        features: FeatureFlags,
        /// Fingerprint of the client's secret key material, zero when
        /// secure copy is not requested.
        secret: Fingerprint,
    },
    /// Negotiation reply.
    HelloAck {
        /// Server protocol version.
        version: u32,
        /// Features the server grants.
        granted: FeatureFlags,
        /// Server-assigned session id.
        session_id: u32,
    },
    /// Destination root for the session. Must be absolute.
    Env {
        /// Destination root path on the server.
        dest_root: String,
    },
    /// Client wants to push a file.
    FileSend {
        /// Identity key: relative name, stamp and size.
        key: FileKey,
        /// Declared content fingerprint.
        fingerprint: Fingerprint,
        /// Transfer hints.
        hints: SendHints,
    },
    /// Server's transfer decision.
    FileRecv {
        /// The decision.
        directive: Directive,
    },
    /// Bulk payload chunk.
    Bytes {
        /// Chunk bytes; interpretation depends on the active directive.
        payload: Vec<u8>,
    },
    /// End of bulk payload.
    EndBytes {
        /// Fingerprint of the complete transferred content.
        checksum: Fingerprint,
    },
    /// Per-file completion.
    FileAck {
        /// Whether the file was assembled and recorded.
        success: bool,
        /// Fingerprint the server computed over the assembled file.
        fingerprint: Fingerprint,
    },
    /// Register a directory for background priming.
    Prime {
        /// Absolute directory path on the server.
        dir: String,
    },
    /// End-of-session counters.
    Stats {
        /// Server counters.
        stats: ServerStats,
    },
    /// Graceful shutdown.
    Bye {
        /// Human-readable reason.
        reason: String,
    },
    /// Fatal error; the connection closes.
    Err {
        /// Error kind.
        kind: ErrKind,
        /// Human-readable description.
        message: String,
    },
}

impl Message {
    /// The message's wire tag.
    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Self::Hello { .. } => Tag::Hello,
            Self::HelloAck { .. } => Tag::HelloAck,
            Self::Env { .. } => Tag::Env,
            Self::FileSend { .. } => Tag::FileSend,
            Self::FileRecv { .. } => Tag::FileRecv,
            Self::Bytes { .. } => Tag::Bytes,
            Self::EndBytes { .. } => Tag::EndBytes,
            Self::FileAck { .. } => Tag::FileAck,
            Self::Prime { .. } => Tag::Prime,
            Self::Stats { .. } => Tag::Stats,
            Self::Bye { .. } => Tag::Bye,
            Self::Err { .. } => Tag::Err,
        }
    }

    /// Short name for diagnostics and transition errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self.tag() {
            Tag::Hello => "HELLO",
            Tag::HelloAck => "HELLO_ACK",
            Tag::Env => "ENV",
            Tag::FileSend => "FILE_SEND",
            Tag::FileRecv => "FILE_RECV",
            Tag::Bytes => "BYTES",
            Tag::EndBytes => "END_BYTES",
            Tag::FileAck => "FILE_ACK",
            Tag::Prime => "PRIME",
            Tag::Stats => "STATS",
            Tag::Bye => "BYE",
            Tag::Err => "ERR",
        }
    }

    /// Frames and writes this message.
    pub fn write(&self, w: &mut impl Write) -> ProtocolResult<()> {
        let mut body = BodyWriter::new();
        match self {
            Self::Hello {
                version,
                features,
                secret,
            } => {
                body.u32(*version);
                body.u8(features.bits());
                body.fingerprint(*secret);
            }
            Self::HelloAck {
                version,
                granted,
                session_id,
            } => {
                body.u32(*version);
                body.u8(granted.bits());
                body.u32(*session_id);
            }
            Self::Env { dest_root } => body.string(dest_root)?,
            Self::FileSend {
                key,
                fingerprint,
                hints,
            } => {
                body.string(&key.name)?;
                body.stamp(key.stamp);
                body.u64(key.size);
                body.fingerprint(*fingerprint);
                body.u8(hints.bits());
            }
            Self::FileRecv { directive } => directive.encode(&mut body)?,
            Self::Bytes { payload } => body.raw(payload),
            Self::EndBytes { checksum } => body.fingerprint(*checksum),
            Self::FileAck {
                success,
                fingerprint,
            } => {
                body.u8(u8::from(*success));
                body.fingerprint(*fingerprint);
            }
            Self::Prime { dir } => body.string(dir)?,
            Self::Stats { stats } => {
                body.u64(stats.files_linked);
                body.u64(stats.files_delta);
                body.u64(stats.files_compressed);
                body.u64(stats.files_raw);
                body.u64(stats.wire_bytes);
                body.u64(stats.db_rows);
            }
            Self::Bye { reason } => body.string(reason)?,
            Self::Err { kind, message } => {
                body.u8(*kind as u8);
                body.string(message)?;
            }
        }
        write_frame(w, self.tag() as u8, &body.into_bytes())
    }

    /// Reads and parses one message.
    pub fn read(r: &mut impl Read) -> ProtocolResult<Self> {
        let (tag, body) = read_frame(r)?;
        Self::decode(Tag::try_from(tag)?, &body)
    }

    /// Parses a message body for `tag`.
    pub fn decode(tag: Tag, body: &[u8]) -> ProtocolResult<Self> {
        let mut reader = BodyReader::new(body);
        let message = match tag {
            Tag::Hello => Self::Hello {
                version: reader.u32()?,
                features: FeatureFlags::from_bits(reader.u8()?),
                secret: reader.fingerprint()?,
            },
            Tag::HelloAck => Self::HelloAck {
                version: reader.u32()?,
                granted: FeatureFlags::from_bits(reader.u8()?),
                session_id: reader.u32()?,
            },
            Tag::Env => Self::Env {
                dest_root: reader.string()?,
            },
            Tag::FileSend => {
                let name = reader.string()?;
                let stamp: FileStamp = reader.stamp()?;
                let size = reader.u64()?;
                Self::FileSend {
                    key: FileKey::new(name, stamp, size),
                    fingerprint: reader.fingerprint()?,
                    hints: SendHints::from_bits(reader.u8()?),
                }
            }
            Tag::FileRecv => Self::FileRecv {
                directive: Directive::decode(&mut reader)?,
            },
            Tag::Bytes => Self::Bytes {
                payload: reader.rest().to_vec(),
            },
            Tag::EndBytes => Self::EndBytes {
                checksum: reader.fingerprint()?,
            },
            Tag::FileAck => Self::FileAck {
                success: reader.u8()? != 0,
                fingerprint: reader.fingerprint()?,
            },
            Tag::Prime => Self::Prime {
                dir: reader.string()?,
            },
            Tag::Stats => Self::Stats {
                stats: ServerStats {
                    files_linked: reader.u64()?,
                    files_delta: reader.u64()?,
                    files_compressed: reader.u64()?,
                    files_raw: reader.u64()?,
                    wire_bytes: reader.u64()?,
                    db_rows: reader.u64()?,
                },
            },
            Tag::Bye => Self::Bye {
                reason: reader.string()?,
            },
            Tag::Err => Self::Err {
                kind: ErrKind::from_wire(reader.u8()?),
                message: reader.string()?,
            },
        };
        reader.finish()?;
        Ok(message)
    }
}

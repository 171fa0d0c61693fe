//! Client side of a copy-server session.
//!
//! One session per worker, established lazily on the first remote file and
//! kept for the worker's lifetime. The protocol is synchronous: the worker
//! sends a request and blocks on the reply, interleaving bulk frames as
//! they stream. Delta transfers run in two halves: the server ships the
//! signature of its reference, the worker answers with the token stream
//! for the new content.

use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::debug;

use codec::{
    ChunkCompressor, CompressionAlgorithm, CompressionGovernor, DeltaGenerator, DeltaIndex,
    FileSignature, MAX_CHUNK_PAYLOAD,
};
use fileio::{open_read, BufferPolicy, CopyContext, FsError, IoStats};
use hashdb::{FileKey, Fingerprint};
use protocol::{
    Directive, ErrKind, FeatureFlags, Message, ProtocolError, SendHints, ServerStats,
    SessionEvent, SessionState, PROTOCOL_VERSION,
};

use crate::job::Timeouts;
use crate::status::FailureKind;

/// Session-level failure with enough structure for the retry policy.
#[derive(Debug, Error)]
pub(crate) enum SessionError {
    /// Wire or peer failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Codec failure on a stream this session carried.
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
    /// Local file failure while feeding the session.
    #[error(transparent)]
    Fs(#[from] FsError),
    /// The job's cancel flag was observed mid-transfer.
    #[error("transfer cancelled")]
    Cancelled,
    /// The server acked the file as failed (fingerprint mismatch on its
    /// side; the upload was quarantined).
    #[error("server rejected the assembled file")]
    Rejected,
}

impl SessionError {
    pub(crate) fn kind(&self) -> FailureKind {
        match self {
            Self::Protocol(e) => FailureKind::from_protocol(e),
            Self::Codec(_) => FailureKind::CodecCorrupt,
            Self::Fs(e) => FailureKind::from_fs(e),
            Self::Cancelled => FailureKind::Cancelled,
            Self::Rejected => FailureKind::Other,
        }
    }
}

/// How the server satisfied one pushed file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RemoteOutcome {
    /// Deduplicated server-side; no bulk bytes moved.
    ServerHad,
    /// Raw stream.
    Raw,
    /// Chunk-compressed stream.
    Compressed,
    /// Delta token stream against a server-side reference.
    Delta,
}

pub(crate) struct ServerSession {
    stream: TcpStream,
    state: SessionState,
    granted: FeatureFlags,
    session_id: u32,
    /// Bulk payload bytes this session has put on the wire.
    pub wire_bytes: u64,
}

impl ServerSession {
    /// Connects, negotiates and announces the destination root.
    pub(crate) fn connect(
        addr: SocketAddr,
        timeouts: &Timeouts,
        offered: FeatureFlags,
        dest_root: &Path,
    ) -> Result<Self, SessionError> {
        let stream = if timeouts.connect.is_zero() {
            TcpStream::connect(addr).map_err(ProtocolError::from)?
        } else {
            TcpStream::connect_timeout(&addr, timeouts.connect).map_err(ProtocolError::from)?
        };
        stream.set_nodelay(true).map_err(ProtocolError::from)?;
        if !timeouts.idle.is_zero() {
            stream
                .set_read_timeout(Some(timeouts.idle))
                .map_err(ProtocolError::from)?;
            stream
                .set_write_timeout(Some(timeouts.idle))
                .map_err(ProtocolError::from)?;
        }

        let mut session = Self {
            stream,
            state: SessionState::Negotiating,
            granted: FeatureFlags::empty(),
            session_id: 0,
            wire_bytes: 0,
        };

        session.send(&Message::Hello {
            version: PROTOCOL_VERSION,
            features: offered,
            secret: Fingerprint::ZERO,
        })?;
        match session.receive()? {
            Message::HelloAck {
                version,
                granted,
                session_id,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch {
                        ours: PROTOCOL_VERSION,
                        theirs: version,
                    }
                    .into());
                }
                session.granted = granted;
                session.session_id = session_id;
                session.state = session.state.advance(SessionEvent::Negotiated)?;
            }
            other => return Err(unexpected(&other).into()),
        }

        session.send(&Message::Env {
            dest_root: dest_root.to_string_lossy().into_owned(),
        })?;
        debug!(session_id = session.session_id, "session negotiated");
        Ok(session)
    }

    /// Features the server granted.
    pub(crate) fn granted(&self) -> FeatureFlags {
        self.granted
    }

    /// Pushes one file, following the server's directive. Returns the
    /// transfer shape and the fingerprint the server computed.
    pub(crate) fn send_file(
        &mut self,
        key: &FileKey,
        fingerprint: Fingerprint,
        hints: SendHints,
        source: &Path,
        ctx: &mut CopyContext,
        stats: &mut IoStats,
        cancel: &AtomicBool,
    ) -> Result<(RemoteOutcome, Fingerprint), SessionError> {
        self.state = self.state.advance(SessionEvent::FileStarted)?;
        self.send(&Message::FileSend {
            key: key.clone(),
            fingerprint,
            hints,
        })?;

        let directive = match self.receive()? {
            Message::FileRecv { directive } => directive,
            other => return Err(unexpected(&other).into()),
        };

        let outcome = match directive {
            Directive::AlreadyHave => RemoteOutcome::ServerHad,
            Directive::SendRaw => {
                self.stream_raw(source, fingerprint, ctx, stats, cancel)?;
                RemoteOutcome::Raw
            }
            Directive::SendCompressed { algorithm } => {
                let algorithm = CompressionAlgorithm::from_wire_id(algorithm)
                    .ok_or(ProtocolError::BadPayload("unknown compression algorithm"))?;
                self.stream_compressed(source, fingerprint, algorithm, ctx, stats, cancel)?;
                RemoteOutcome::Compressed
            }
            Directive::SendDelta { reference } => {
                debug!(reference = %reference, "delta directive");
                self.stream_delta(source, fingerprint, ctx, stats, cancel)?;
                RemoteOutcome::Delta
            }
        };

        let ack = self.await_ack()?;
        Ok((outcome, ack))
    }

    /// Ends the session gracefully, returning the server's counters.
    pub(crate) fn finish(mut self) -> Result<ServerStats, SessionError> {
        self.send(&Message::Bye {
            reason: "done".into(),
        })?;
        self.state = self.state.advance(SessionEvent::ByeRequested)?;
        match self.receive()? {
            Message::Stats { stats } => {
                self.state = self.state.advance(SessionEvent::StatsFlushed)?;
                Ok(stats)
            }
            other => Err(unexpected(&other).into()),
        }
    }

    fn await_ack(&mut self) -> Result<Fingerprint, SessionError> {
        match self.receive()? {
            Message::FileAck {
                success,
                fingerprint,
            } => {
                self.state = self.state.advance(SessionEvent::FileAcked)?;
                if success {
                    Ok(fingerprint)
                } else {
                    Err(SessionError::Rejected)
                }
            }
            other => Err(unexpected(&other).into()),
        }
    }

    fn stream_raw(
        &mut self,
        source: &Path,
        fingerprint: Fingerprint,
        ctx: &mut CopyContext,
        stats: &mut IoStats,
        cancel: &AtomicBool,
    ) -> Result<(), SessionError> {
        let mut reader = open_read(source, BufferPolicy::Auto, true, true, stats)?;
        let (buf, _, _) = ctx.buffers();
        let chunk = &mut buf[..MAX_CHUNK_PAYLOAD];
        loop {
            if cancel.load(Ordering::Relaxed) {
                reader.close(stats);
                return Err(self.cancelled());
            }
            let read = match reader.read(chunk, stats) {
                Ok(read) => read,
                Err(e) => {
                    reader.close(stats);
                    return Err(e.into());
                }
            };
            if read == 0 {
                break;
            }
            let payload = chunk[..read].to_vec();
            self.wire_bytes += payload.len() as u64;
            if let Err(e) = self.send(&Message::Bytes { payload }) {
                reader.close(stats);
                return Err(e.into());
            }
        }
        reader.close(stats);
        self.send(&Message::EndBytes {
            checksum: fingerprint,
        })?;
        Ok(())
    }

    fn stream_compressed(
        &mut self,
        source: &Path,
        fingerprint: Fingerprint,
        algorithm: CompressionAlgorithm,
        ctx: &mut CopyContext,
        stats: &mut IoStats,
        cancel: &AtomicBool,
    ) -> Result<(), SessionError> {
        let mut reader = open_read(source, BufferPolicy::Auto, true, true, stats)?;
        let size = reader.info(stats)?.size;
        let mut encoder = ChunkCompressor::begin(algorithm, size);
        let mut governor = CompressionGovernor::new(CompressionAlgorithm::DEFAULT_ZSTD_LEVEL, false);
        let (buf, _, _) = ctx.buffers();
        let chunk = &mut buf[..MAX_CHUNK_PAYLOAD];

        let result = (|| -> Result<(), SessionError> {
            loop {
                if cancel.load(Ordering::Relaxed) {
                    return Err(self.cancelled());
                }
                let read = reader.read(chunk, stats)?;
                if read == 0 {
                    break;
                }
                let mut framed = Vec::new();
                let compress_start = std::time::Instant::now();
                encoder.feed(&chunk[..read], &mut framed)?;
                let compress_nanos = elapsed_nanos(compress_start);

                let sent = framed.len() as u64;
                let wire_start = std::time::Instant::now();
                self.send_bulk(framed)?;
                let level = governor.observe(sent, elapsed_nanos(wire_start), compress_nanos);
                encoder.set_level(level);
            }
            let mut trailer = Vec::new();
            encoder.finish(&mut trailer);
            self.send_bulk(trailer)?;
            self.send(&Message::EndBytes {
                checksum: fingerprint,
            })?;
            Ok(())
        })();
        reader.close(stats);
        result
    }

    fn stream_delta(
        &mut self,
        source: &Path,
        fingerprint: Fingerprint,
        ctx: &mut CopyContext,
        stats: &mut IoStats,
        cancel: &AtomicBool,
    ) -> Result<(), SessionError> {
        // First half: the server ships the signature of its reference.
        let mut signature_bytes = Vec::new();
        loop {
            match self.receive()? {
                Message::Bytes { payload } => signature_bytes.extend_from_slice(&payload),
                Message::EndBytes { .. } => break,
                other => return Err(unexpected(&other).into()),
            }
        }
        let signature = FileSignature::from_bytes(&signature_bytes)?;
        let index = DeltaIndex::from_signature(&signature);
        let mut generator = DeltaGenerator::begin(index);

        // Second half: scan the new content and ship the token stream.
        let mut reader = open_read(source, BufferPolicy::Auto, true, true, stats)?;
        let (buf, _, _) = ctx.buffers();
        let chunk = &mut buf[..MAX_CHUNK_PAYLOAD];

        let result = (|| -> Result<(), SessionError> {
            loop {
                if cancel.load(Ordering::Relaxed) {
                    return Err(self.cancelled());
                }
                let read = reader.read(chunk, stats)?;
                if read == 0 {
                    break;
                }
                let mut tokens = Vec::new();
                generator.feed(&chunk[..read], &mut tokens);
                self.send_bulk(tokens)?;
            }
            let mut trailer = Vec::new();
            generator.finish(&mut trailer);
            self.send_bulk(trailer)?;
            self.send(&Message::EndBytes {
                checksum: fingerprint,
            })?;
            Ok(())
        })();
        reader.close(stats);
        result
    }

    /// Splits bulk bytes into frame-sized `BYTES` messages.
    fn send_bulk(&mut self, data: Vec<u8>) -> Result<(), SessionError> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() <= MAX_CHUNK_PAYLOAD {
            self.wire_bytes += data.len() as u64;
            self.send(&Message::Bytes { payload: data })?;
            return Ok(());
        }
        for piece in data.chunks(MAX_CHUNK_PAYLOAD) {
            self.wire_bytes += piece.len() as u64;
            self.send(&Message::Bytes {
                payload: piece.to_vec(),
            })?;
        }
        Ok(())
    }

    fn cancelled(&mut self) -> SessionError {
        let _ = self.send(&Message::Err {
            kind: ErrKind::Cancelled,
            message: "job cancelled".into(),
        });
        self.state = SessionState::Closed;
        SessionError::Cancelled
    }

    fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        message.write(&mut self.stream)
    }

    fn receive(&mut self) -> Result<Message, ProtocolError> {
        match Message::read(&mut self.stream)? {
            Message::Err { kind, message } => {
                self.state = SessionState::Closed;
                Err(ProtocolError::Remote { kind, message })
            }
            message => Ok(message),
        }
    }
}

fn elapsed_nanos(start: std::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn unexpected(message: &Message) -> ProtocolError {
    ProtocolError::BadTransition {
        state: "client",
        message: message.name(),
    }
}

//! One client session: the server side of the protocol state machine.
//!
//! Sessions run one per thread. Uploads land in a `.tmp` sibling and are
//! renamed into place only after the incoming stream has been
//! re-fingerprinted, so a session failure never leaves a half-written
//! destination file and never poisons the database. A fingerprint mismatch
//! quarantines the upload as `.corrupt` and acks failure; everything else
//! about the session keeps going.

use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use codec::{
    ChunkDecompressor, CodecError, CompressionAlgorithm, DeltaApplier, FileSignature,
    MAX_CHUNK_PAYLOAD,
};
use fileio::{
    create_link, delete_file, ensure_directory, file_info, move_file, open_read, open_write,
    set_mtime, BufferPolicy, CopyContext, FsError, IoStats, WriteHandle,
};
use hashdb::{hash_file, FileKey, Fingerprint};
use logging::{log_debug, log_error, LogScope};
use protocol::{
    Directive, ErrKind, FeatureFlags, Message, ProtocolError, SendHints, SessionEvent,
    SessionState, PROTOCOL_VERSION,
};

use crate::server::{Counters, SharedState};

#[derive(Debug, Error)]
enum SessionFailure {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Violation(&'static str),
}

impl SessionFailure {
    fn err_kind(&self) -> ErrKind {
        match self {
            Self::Protocol(_) | Self::Violation(_) => ErrKind::ProtocolViolation,
            Self::Codec(_) => ErrKind::CodecCorrupt,
            Self::Fs(e) if e.is_disk_full() => ErrKind::DiskFull,
            Self::Fs(_) => ErrKind::Other,
        }
    }
}

/// Runs one accepted connection to completion.
pub(crate) fn run_session(mut stream: TcpStream, shared: Arc<SharedState>, session_id: u32) {
    let _scope = LogScope::enter(Some(&format!("session-{session_id}")));
    debug!(session_id, "session started");

    if let Err(failure) = drive(&mut stream, &shared, session_id) {
        log_error!(shared.logger, "session {session_id} failed: {failure}");
        // Best effort: tell the peer why before the socket drops.
        let _ = Message::Err {
            kind: failure.err_kind(),
            message: failure.to_string(),
        }
        .write(&mut stream);
    }
    debug!(session_id, "session ended");
}

fn drive(
    stream: &mut TcpStream,
    shared: &SharedState,
    session_id: u32,
) -> Result<(), SessionFailure> {
    let mut stats = IoStats::default();
    let mut ctx = CopyContext::new();
    let mut state = SessionState::Negotiating;

    let (client_features, _secret) = match Message::read(stream)? {
        Message::Hello {
            version,
            features,
            secret,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: version,
                }
                .into());
            }
            (features, secret)
        }
        _ => return Err(SessionFailure::Violation("expected HELLO")),
    };

    let mut granted = client_features.intersect(shared.features);
    if shared.degraded.load(Ordering::Relaxed) {
        granted = granted.without(FeatureFlags::DELTA);
    }
    Message::HelloAck {
        version: PROTOCOL_VERSION,
        granted,
        session_id,
    }
    .write(stream)?;
    state = state.advance(SessionEvent::Negotiated)?;

    let mut dest_root: Option<PathBuf> = None;

    loop {
        let message = Message::read(stream)?;
        match message {
            Message::Env { dest_root: root } => {
                let root = PathBuf::from(root);
                if !root.is_absolute() {
                    return Err(SessionFailure::Violation("destination root must be absolute"));
                }
                // The previous generation under this root feeds dedup and
                // delta references; scan it in the background.
                shared
                    .db
                    .prime_directory(&root, false, &mut ctx, &mut stats)?;
                dest_root = Some(root);
            }
            Message::Prime { dir } => {
                let dir = PathBuf::from(dir);
                if !dir.is_absolute() {
                    return Err(SessionFailure::Violation("prime directory must be absolute"));
                }
                shared
                    .db
                    .prime_directory(&dir, false, &mut ctx, &mut stats)?;
            }
            Message::FileSend {
                key,
                fingerprint,
                hints,
            } => {
                state = state.advance(SessionEvent::FileStarted)?;
                let root = dest_root
                    .as_deref()
                    .ok_or(SessionFailure::Violation("FILE_SEND before ENV"))?;
                handle_file(
                    stream, shared, root, key, fingerprint, hints, granted, &mut ctx, &mut stats,
                )?;
                state = state.advance(SessionEvent::FileAcked)?;
            }
            Message::Bye { .. } => {
                state = state.advance(SessionEvent::ByeRequested)?;
                Message::Stats {
                    stats: shared.counters.snapshot(shared.db.len() as u64),
                }
                .write(stream)?;
                let _ = state.advance(SessionEvent::StatsFlushed)?;
                return Ok(());
            }
            Message::Err { kind, message } => {
                log_debug!(shared.logger, "peer error ({kind}): {message}");
                return Ok(());
            }
            other => {
                let _ = other;
                return Err(SessionFailure::Violation("unexpected message"));
            }
        }
    }
}

/// Applies the server decision policy to one pushed file.
#[allow(clippy::too_many_arguments)]
fn handle_file(
    stream: &mut TcpStream,
    shared: &SharedState,
    dest_root: &Path,
    key: FileKey,
    declared: Fingerprint,
    hints: SendHints,
    granted: FeatureFlags,
    ctx: &mut CopyContext,
    stats: &mut IoStats,
) -> Result<(), SessionFailure> {
    let rel = sanitize_rel(&key.name)?;
    let dest = dest_root.join(rel);
    if let Some(parent) = dest.parent() {
        ensure_directory(parent, false, true, stats, None)?;
    }

    // Already in place with the same cheap identity: nothing to transfer.
    if let Ok(info) = file_info(&dest, stats) {
        if info.size == key.size && info.stamp == key.stamp {
            shared.counters.linked.fetch_add(1, Ordering::Relaxed);
            shared
                .db
                .insert(key, declared, dest.clone(), stats);
            Message::FileRecv {
                directive: Directive::AlreadyHave,
            }
            .write(stream)?;
            Message::FileAck {
                success: true,
                fingerprint: declared,
            }
            .write(stream)?;
            return Ok(());
        }
    }

    // Content dedup: the database knows a file with these exact bytes.
    if declared.is_valid() && !shared.degraded.load(Ordering::Relaxed) {
        if let Some(record) = shared.db.get_by_fingerprint(declared) {
            if file_info(&record.path, stats).is_err() {
                // Stale row; the representative vanished. Heal and move on.
                shared.db.remove_by_fingerprint(declared);
            } else if record.path != dest && attempt_link(&record.path, &dest, stats).is_ok() {
                set_mtime(&dest, key.stamp, stats)?;
                shared.counters.linked.fetch_add(1, Ordering::Relaxed);
                shared
                    .db
                    .insert(key.clone(), declared, dest.clone(), stats);
                Message::FileRecv {
                    directive: Directive::AlreadyHave,
                }
                .write(stream)?;
                Message::FileAck {
                    success: true,
                    fingerprint: declared,
                }
                .write(stream)?;
                return Ok(());
            }
        }
    }

    // Pick the transfer shape and collect the bytes into a `.tmp` sibling.
    let tmp = sibling_with_suffix(&dest, ".tmp");
    let guard = TmpGuard { path: tmp.clone() };

    let delta_reference = if granted.contains(FeatureFlags::DELTA)
        && hints.delta_ok
        && !shared.degraded.load(Ordering::Relaxed)
    {
        shared
            .db
            .find_delta_reference(&key)
            .filter(|path| file_info(path, stats).is_ok())
    } else {
        None
    };

    let wire_bytes = if let Some(reference) = delta_reference {
        Message::FileRecv {
            directive: Directive::SendDelta {
                reference: reference.to_string_lossy().into_owned(),
            },
        }
        .write(stream)?;
        shared.counters.delta.fetch_add(1, Ordering::Relaxed);
        receive_delta(stream, &reference, &tmp, stats)?
    } else if granted.contains(FeatureFlags::COMPRESSION) && hints.compressible {
        Message::FileRecv {
            directive: Directive::SendCompressed {
                algorithm: shared.compression.wire_id(),
            },
        }
        .write(stream)?;
        shared.counters.compressed.fetch_add(1, Ordering::Relaxed);
        receive_compressed(stream, shared.compression, &tmp, stats)?
    } else {
        Message::FileRecv {
            directive: Directive::SendRaw,
        }
        .write(stream)?;
        shared.counters.raw.fetch_add(1, Ordering::Relaxed);
        receive_raw(stream, &tmp, stats)?
    };
    shared
        .counters
        .wire_bytes
        .fetch_add(wire_bytes, Ordering::Relaxed);

    // Re-fingerprint the assembled file before trusting it.
    let actual = match hash_file(&tmp, shared.db.seed(), ctx, stats) {
        Ok(actual) => actual,
        Err(e) => {
            // Cannot verify what we just wrote: degrade dedup and delta
            // rather than recording unverified rows.
            shared.degraded.store(true, Ordering::Relaxed);
            log_error!(shared.logger, "cannot verify upload {}: {e}", key.name);
            Message::FileAck {
                success: false,
                fingerprint: Fingerprint::ZERO,
            }
            .write(stream)?;
            return Ok(());
        }
    };

    if declared.is_valid() && actual != declared {
        let corrupt = sibling_with_suffix(&dest, ".corrupt");
        move_file(&tmp, &corrupt, stats)?;
        guard.disarm();
        log_error!(
            shared.logger,
            "{}: fingerprint mismatch, quarantined as .corrupt",
            key.name
        );
        Message::FileAck {
            success: false,
            fingerprint: actual,
        }
        .write(stream)?;
        return Ok(());
    }

    move_file(&tmp, &dest, stats)?;
    guard.disarm();
    set_mtime(&dest, key.stamp, stats)?;
    shared.db.insert(key, actual, dest, stats);
    Message::FileAck {
        success: true,
        fingerprint: actual,
    }
    .write(stream)?;
    Ok(())
}

/// Receives raw `BYTES` frames into `tmp` until `END_BYTES`.
fn receive_raw(
    stream: &mut TcpStream,
    tmp: &Path,
    stats: &mut IoStats,
) -> Result<u64, SessionFailure> {
    let mut handle = open_write(tmp, BufferPolicy::Auto, true, false, stats)?;
    let mut wire = 0u64;
    let result = loop {
        match Message::read(stream) {
            Ok(Message::Bytes { payload }) => {
                wire += payload.len() as u64;
                if let Err(e) = handle.write(&payload, stats) {
                    break Err(e.into());
                }
            }
            Ok(Message::EndBytes { .. }) => break Ok(wire),
            Ok(Message::Err { kind, message }) => {
                break Err(ProtocolError::Remote { kind, message }.into())
            }
            Ok(_) => break Err(SessionFailure::Violation("expected BYTES")),
            Err(e) => break Err(e.into()),
        }
    };
    match result {
        Ok(wire) => {
            handle.close(stats)?;
            Ok(wire)
        }
        Err(e) => Err(e),
    }
}

/// Receives compressed frames, decoding into `tmp` until `END_BYTES`.
fn receive_compressed(
    stream: &mut TcpStream,
    algorithm: CompressionAlgorithm,
    tmp: &Path,
    stats: &mut IoStats,
) -> Result<u64, SessionFailure> {
    let mut handle = open_write(tmp, BufferPolicy::Auto, true, false, stats)?;
    let mut decoder = ChunkDecompressor::begin(algorithm);
    let mut wire = 0u64;
    let mut out = Vec::new();

    let result = loop {
        match Message::read(stream) {
            Ok(Message::Bytes { payload }) => {
                wire += payload.len() as u64;
                out.clear();
                if let Err(e) = decoder.feed(&payload, &mut out) {
                    break Err(e.into());
                }
                if let Err(e) = handle.write(&out, stats) {
                    break Err(e.into());
                }
            }
            Ok(Message::EndBytes { .. }) => match decoder.verify_finished() {
                Ok(()) => break Ok(wire),
                Err(e) => break Err(e.into()),
            },
            Ok(Message::Err { kind, message }) => {
                break Err(ProtocolError::Remote { kind, message }.into())
            }
            Ok(_) => break Err(SessionFailure::Violation("expected BYTES")),
            Err(e) => break Err(e.into()),
        }
    };
    match result {
        Ok(wire) => {
            handle.close(stats)?;
            Ok(wire)
        }
        Err(e) => Err(e),
    }
}

/// Sends the reference signature, then applies the returned token stream
/// against the reference into `tmp`.
fn receive_delta(
    stream: &mut TcpStream,
    reference: &Path,
    tmp: &Path,
    stats: &mut IoStats,
) -> Result<u64, SessionFailure> {
    // First half: ship the signature of our reference.
    let mut ref_handle = open_read(reference, BufferPolicy::Auto, true, true, stats)?;
    let ref_size = ref_handle.info(stats)?.size;
    let signature = match FileSignature::generate(&mut ref_handle, ref_size) {
        Ok(signature) => {
            ref_handle.close(stats);
            signature
        }
        Err(e) => {
            ref_handle.close(stats);
            return Err(e.into());
        }
    };
    for piece in signature.to_bytes().chunks(MAX_CHUNK_PAYLOAD) {
        Message::Bytes {
            payload: piece.to_vec(),
        }
        .write(stream)?;
    }
    Message::EndBytes {
        checksum: Fingerprint::ZERO,
    }
    .write(stream)?;

    // Second half: replay the client's tokens against the reference.
    let basis = open_read(reference, BufferPolicy::Auto, false, true, stats)?;
    let mut applier = DeltaApplier::begin(basis, signature.block_length() as usize);
    let mut handle = open_write(tmp, BufferPolicy::Auto, true, false, stats)?;
    let mut wire = 0u64;

    let result = loop {
        match Message::read(stream) {
            Ok(Message::Bytes { payload }) => {
                wire += payload.len() as u64;
                let mut sink = StatWriter {
                    handle: &mut handle,
                    stats: &mut *stats,
                };
                if let Err(e) = applier.feed(&payload, &mut sink) {
                    break Err(e.into());
                }
            }
            Ok(Message::EndBytes { .. }) => match applier.verify_finished() {
                Ok(()) => break Ok(wire),
                Err(e) => break Err(e.into()),
            },
            Ok(Message::Err { kind, message }) => {
                break Err(ProtocolError::Remote { kind, message }.into())
            }
            Ok(_) => break Err(SessionFailure::Violation("expected BYTES")),
            Err(e) => break Err(e.into()),
        }
    };
    match result {
        Ok(wire) => {
            handle.close(stats)?;
            Ok(wire)
        }
        Err(e) => Err(e),
    }
}

/// Adapter charging applier writes into the session's statistics.
struct StatWriter<'a, 'b> {
    handle: &'a mut WriteHandle,
    stats: &'b mut IoStats,
}

impl Write for StatWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.handle
            .write(buf, self.stats)
            .map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Hardlink with one delete-and-retry when the destination exists.
fn attempt_link(existing: &Path, new_path: &Path, stats: &mut IoStats) -> Result<(), FsError> {
    let scope = LogScope::enter(None);
    scope.mute();
    match create_link(existing, new_path, stats) {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => {
            delete_file(new_path, true, stats)?;
            create_link(existing, new_path, stats)
        }
        Err(e) => Err(e),
    }
}

/// Validates a wire-supplied relative name: rejects absolute paths and any
/// `..` component, so a session can never write outside the destination
/// root.
fn sanitize_rel(name: &str) -> Result<PathBuf, SessionFailure> {
    if name.is_empty() {
        return Err(SessionFailure::Violation("empty file name"));
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(SessionFailure::Violation("file name must be relative"));
    }
    for component in path.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => return Err(SessionFailure::Violation("file name escapes the root")),
        }
    }
    Ok(path.to_path_buf())
}

/// `path` with `suffix` appended to its file name.
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Deletes the staged upload unless disarmed by a successful rename.
struct TmpGuard {
    path: PathBuf,
}

impl TmpGuard {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for TmpGuard {
    fn drop(&mut self) {
        let mut stats = IoStats::default();
        let _ = delete_file(&self.path, false, &mut stats);
    }
}

/// Counter snapshot helper lives with the counters.
impl Counters {
    pub(crate) fn snapshot(&self, db_rows: u64) -> protocol::ServerStats {
        protocol::ServerStats {
            files_linked: self.linked.load(Ordering::Relaxed),
            files_delta: self.delta.load(Ordering::Relaxed),
            files_compressed: self.compressed.load(Ordering::Relaxed),
            files_raw: self.raw.load(Ordering::Relaxed),
            wire_bytes: self.wire_bytes.load(Ordering::Relaxed),
            db_rows,
        }
    }
}

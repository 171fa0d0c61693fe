//! Worker threads: the per-file decision tree and retry policy.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use fileio::{
    copy_file, create_link, delete_file, file_info, BufferPolicy, CopyContext, FileStamp,
    FsError, IoStats,
};
use hashdb::{hash_file, FileKey, Fingerprint};
use logging::{log_debug, log_error, LogScope};
use protocol::{FeatureFlags, SendHints};

use crate::client::{RemoteOutcome, ServerSession, SessionError};
use crate::job::CopyJob;
use crate::queue::BoundedQueue;
use crate::status::{FailureKind, FileStatus, Outcome, NOTE_HARDLINK_FELL_BACK};
use crate::walk::{join_rel, WorkItem};

/// Files below this size are never worth a delta round trip.
const DELTA_MIN_SIZE: u64 = 64 * 1024;
/// Files below this size are sent raw even when compression is granted.
const COMPRESS_MIN_SIZE: u64 = 1024;

/// State shared by every worker of one job.
pub(crate) struct Shared<'job> {
    pub job: &'job CopyJob,
    pub queue: &'job BoundedQueue<WorkItem>,
    /// Key index of the previous destination generation (hardlink pre-pass).
    pub dest_index: Option<FxHashMap<FileKey, PathBuf>>,
    /// Fingerprint index of files this run has already written, for local
    /// content dedup. The stamp gates linking: links share an inode and
    /// therefore a last-write time, so only same-stamp sources may share.
    pub content_index: Mutex<FxHashMap<Fingerprint, (PathBuf, FileStamp)>>,
    /// Completion-ordered per-file statuses.
    pub statuses: Mutex<Vec<FileStatus>>,
}

impl Shared<'_> {
    fn record(&self, rel: String, outcome: Outcome, note: Option<&'static str>) {
        let mut statuses = self
            .statuses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        statuses.push(FileStatus { rel, outcome, note });
    }

    /// Records an item that never reached a worker before cancellation.
    pub(crate) fn record_cancelled(&self, rel: String) {
        self.record(
            rel,
            Outcome::Failed {
                kind: FailureKind::Cancelled,
            },
            None,
        );
    }

    /// Unwraps the completion-ordered status list.
    pub(crate) fn into_statuses(self) -> Vec<FileStatus> {
        self.statuses
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// One worker: drains the queue until it closes, then returns its local
/// statistics for the join-time merge.
pub(crate) fn worker_main(shared: &Shared<'_>, worker_id: usize) -> IoStats {
    let _scope = LogScope::enter(Some(&format!("worker-{worker_id}")));
    let mut ctx = CopyContext::new();
    let mut stats = IoStats::default();
    let mut session: Option<ServerSession> = None;

    while let Some(item) = shared.queue.pop() {
        if shared.job.cancel.load(Ordering::Relaxed) {
            shared.record(item.rel, Outcome::Failed { kind: FailureKind::Cancelled }, None);
            continue;
        }
        process_item(shared, item, &mut ctx, &mut stats, &mut session);
    }

    if let Some(session) = session.take() {
        match session.finish() {
            Ok(server_stats) => {
                log_debug!(
                    shared.job.logger,
                    "session closed: server linked {} files, {} wire bytes",
                    server_stats.files_linked,
                    server_stats.wire_bytes
                );
            }
            Err(e) => log_debug!(shared.job.logger, "session close failed: {e}"),
        }
    }
    stats
}

fn process_item(
    shared: &Shared<'_>,
    item: WorkItem,
    ctx: &mut CopyContext,
    stats: &mut IoStats,
    session: &mut Option<ServerSession>,
) {
    let retry = shared.job.retry;
    let mut allow_delta = shared.job.flags.delta;
    let mut note = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = try_file(shared, &item, ctx, stats, session, &mut note, allow_delta);
        match result {
            Ok(outcome) => {
                shared.record(item.rel, outcome, note);
                return;
            }
            Err(failure) => {
                let kind = failure.kind();
                // A local file error mid-stream leaves the wire desynced;
                // only a fresh session is safe afterwards.
                if matches!(failure, SessionError::Fs(_)) && shared.job.server.is_some() {
                    *session = None;
                }
                match kind {
                    FailureKind::CodecCorrupt | FailureKind::ProtocolViolation => {
                        // Drop the poisoned session; retry the file with
                        // delta disabled so the fallback path is clean.
                        *session = None;
                        allow_delta = false;
                        if attempt < retry.attempts {
                            continue;
                        }
                    }
                    FailureKind::NetworkTransient => {
                        *session = None;
                        if attempt < retry.attempts {
                            std::thread::sleep(retry.delay_for(attempt));
                            continue;
                        }
                    }
                    FailureKind::DestinationBusy => {
                        if attempt < retry.attempts {
                            std::thread::sleep(retry.delay_for(attempt));
                            continue;
                        }
                    }
                    _ => {}
                }
                if kind.is_job_fatal() {
                    shared.job.cancel.store(true, Ordering::Relaxed);
                }
                log_error!(
                    shared.job.logger,
                    "{}: {failure} ({kind})",
                    item.rel
                );
                shared.record(item.rel, Outcome::Failed { kind }, note);
                return;
            }
        }
    }
}

fn try_file(
    shared: &Shared<'_>,
    item: &WorkItem,
    ctx: &mut CopyContext,
    stats: &mut IoStats,
    session: &mut Option<ServerSession>,
    note: &mut Option<&'static str>,
    allow_delta: bool,
) -> Result<Outcome, SessionError> {
    let job = shared.job;
    let src = join_rel(&job.source, &item.rel);

    if job.server.is_some() {
        return send_remote(shared, item, &src, ctx, stats, session, allow_delta);
    }

    let dst = join_rel(&job.dest, &item.rel);

    // Fast path 1: the destination already matches on (size, stamp).
    if job.flags.skip_if_same_key {
        if let Ok(existing) = file_info(&dst, stats) {
            if existing.same_key(&item.info) {
                return Ok(Outcome::Skipped);
            }
        }
    }

    // Fast path 2: the previous generation has this exact key.
    if job.flags.use_hardlinks {
        if let Some(index) = &shared.dest_index {
            let key = FileKey::new(item.rel.clone(), item.info.stamp, item.info.size);
            if let Some(existing) = index.get(&key) {
                if existing != &dst {
                    match attempt_link(existing, &dst, stats) {
                        Ok(()) => return Ok(Outcome::Hardlinked),
                        Err(e) if e.is_link_fallback() => *note = Some(NOTE_HARDLINK_FELL_BACK),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    // Fast path 3: content already written by this run.
    let mut fingerprint = None;
    if job.flags.use_hardlinks {
        let fp = hash_file(&src, job.hash_seed, ctx, stats)?;
        fingerprint = Some(fp);
        let hit = {
            let index = shared
                .content_index
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            index.get(&fp).cloned()
        };
        if let Some((existing, stamp)) = hit {
            if stamp == item.info.stamp && existing != dst {
                match attempt_link(&existing, &dst, stats) {
                    Ok(()) => return Ok(Outcome::Hardlinked),
                    Err(e) if e.is_link_fallback() => *note = Some(NOTE_HARDLINK_FELL_BACK),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    // Fallback: raw copy through the context buffers.
    let bytes = copy_file(
        &src,
        &dst,
        &item.info,
        BufferPolicy::Auto,
        true,
        ctx,
        stats,
    )?;
    verify_size(&dst, item.info.size, stats)?;

    if let Some(fp) = fingerprint {
        let mut index = shared
            .content_index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        index.entry(fp).or_insert((dst, item.info.stamp));
    }
    Ok(Outcome::Copied { bytes })
}

fn send_remote(
    shared: &Shared<'_>,
    item: &WorkItem,
    src: &std::path::Path,
    ctx: &mut CopyContext,
    stats: &mut IoStats,
    session: &mut Option<ServerSession>,
    allow_delta: bool,
) -> Result<Outcome, SessionError> {
    let job = shared.job;
    let addr = job.server.expect("send_remote requires a server address");

    let fingerprint = hash_file(src, job.hash_seed, ctx, stats)?;

    if session.is_none() {
        let mut offered = FeatureFlags::empty();
        if job.flags.compression {
            offered = offered.union(FeatureFlags::COMPRESSION);
        }
        if job.flags.delta {
            offered = offered.union(FeatureFlags::DELTA);
        }
        if job.flags.secure_copy {
            offered = offered.union(FeatureFlags::SECURE_COPY);
        }
        *session = Some(ServerSession::connect(
            addr,
            &job.timeouts,
            offered,
            &job.dest,
        )?);
    }
    let active = session.as_mut().expect("session established above");

    let granted = active.granted();
    let hints = SendHints {
        compressible: granted.contains(FeatureFlags::COMPRESSION)
            && item.info.size >= COMPRESS_MIN_SIZE,
        delta_ok: allow_delta
            && granted.contains(FeatureFlags::DELTA)
            && item.info.size >= DELTA_MIN_SIZE,
    };
    let key = FileKey::new(item.rel.clone(), item.info.stamp, item.info.size);

    let wire_before = active.wire_bytes;
    let (outcome, acked) = active.send_file(
        &key,
        fingerprint,
        hints,
        src,
        ctx,
        stats,
        &job.cancel,
    )?;
    let wire_bytes = active.wire_bytes - wire_before;

    if acked != fingerprint {
        return Err(SessionError::Rejected);
    }
    Ok(match outcome {
        RemoteOutcome::ServerHad => Outcome::ServerHad,
        RemoteOutcome::Raw => Outcome::ServerRaw { wire_bytes },
        RemoteOutcome::Compressed => Outcome::ServerCompressed { wire_bytes },
        RemoteOutcome::Delta => Outcome::ServerDelta { wire_bytes },
    })
}

/// Hardlink with one delete-and-retry when the destination already exists.
/// Runs under a muted scope so a probe that falls back does not spill an
/// error into the log.
fn attempt_link(
    existing: &std::path::Path,
    new_path: &std::path::Path,
    stats: &mut IoStats,
) -> Result<(), FsError> {
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

fn verify_size(dst: &std::path::Path, expected: u64, stats: &mut IoStats) -> Result<(), SessionError> {
    let written = file_info(dst, stats)?;
    if written.size == expected {
        Ok(())
    } else {
        Err(FsError::Io {
            op: "verify-size",
            path: dst.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("wrote {} bytes, expected {expected}", written.size),
            ),
        }
        .into())
    }
}

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `engine` is the EACopy client: it walks a source tree, fans the files
//! out over a fixed pool of worker threads and satisfies each one by the
//! cheapest available path: skip when the destination already matches,
//! hardlink when identical content is already in place, push through a
//! copy-server session when one is configured, or fall back to a raw
//! double-buffered copy.
//!
//! # Design
//!
//! - A single enumerator thread ([`walk`]) feeds a bounded queue
//!   ([`queue`]); queue depth is four items per worker, which backpressures
//!   the walk against slow storage.
//! - Each worker ([`worker`]) owns a [`CopyContext`](fileio::CopyContext)
//!   and a local [`IoStats`](fileio::IoStats); the global aggregate is
//!   assembled only on join, so the hot path touches no shared state.
//! - The client protocol session ([`client`]) is synchronous per worker
//!   and re-established on transient network failure; files in flight are
//!   retried under the job's [`RetryPolicy`].
//! - Outcomes, failure classes and the exit-status contract live in
//!   [`status`].
//!
//! # Invariants
//!
//! - On return from [`run_copy`] no background threads remain alive.
//! - For every enumerated file that matches the predicate, either the
//!   destination holds a file with the same size and content afterwards,
//!   or the per-file status records a failure.
//! - A job run twice against an unchanged source moves zero content bytes
//!   the second time: every file skips or hardlinks.
//! - The engine never writes outside the destination root.

pub mod job;
pub mod queue;
pub mod status;
pub mod walk;

mod client;
mod worker;

pub use job::{CopyJob, FileFilter, JobFlags, RetryPolicy, Timeouts};
pub use status::{
    ExitStatus, FailureKind, FileStatus, JobStats, JobSummary, Outcome, NOTE_HARDLINK_FELL_BACK,
};
pub use walk::WorkItem;

use std::sync::atomic::Ordering;
use std::sync::Mutex;

use logging::{log_debug, log_error, log_info};

use fileio::IoStats;

use crate::queue::BoundedQueue;
use crate::worker::Shared;

/// Queue depth per worker.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

/// Runs one replication job to completion and returns the aggregate.
///
/// Root paths must be absolute (the filesystem contract forbids writes
/// outside the destination root, which relative roots would undermine).
pub fn run_copy(job: &CopyJob) -> JobSummary {
    let logger = job.logger.clone();

    if !job.source.is_absolute() || !job.dest.is_absolute() {
        log_error!(logger, "source and destination roots must be absolute");
        return JobSummary {
            stats: JobStats::default(),
            files: Vec::new(),
            exit: ExitStatus::Fatal,
        };
    }

    let mut walk_stats = IoStats::default();
    let local_dest = job.server.is_none();
    if local_dest {
        if let Err(e) = fileio::ensure_directory(&job.dest, true, false, &mut walk_stats, None) {
            log_error!(logger, "cannot create destination root: {e}");
            return JobSummary {
                stats: JobStats {
                    io: walk_stats,
                    ..JobStats::default()
                },
                files: Vec::new(),
                exit: ExitStatus::Fatal,
            };
        }
    }

    // Optional pre-pass: index the previous destination generation so
    // unchanged files can be served as hardlinks without touching bytes.
    let dest_index = if job.flags.hardlink_prepass && job.server.is_none() {
        match walk::build_dest_index(&job.dest, &mut walk_stats) {
            Ok(index) => {
                log_info!(logger, "hardlink pre-pass indexed {} files", index.len());
                Some(index)
            }
            Err(e) => {
                log_error!(logger, "hardlink pre-pass failed: {e}");
                None
            }
        }
    } else {
        None
    };

    let workers = job.workers.max(1);
    let queue = BoundedQueue::new(workers * QUEUE_DEPTH_PER_WORKER);
    let shared = Shared {
        job,
        queue: &queue,
        dest_index,
        content_index: Mutex::new(Default::default()),
        statuses: Mutex::new(Vec::new()),
    };

    let mut merged = IoStats::default();
    let mut walk_failed = false;

    std::thread::scope(|scope| {
        let walker = scope.spawn(|| {
            let mut stats = IoStats::default();
            let result = walk::walk_source(
                &job.source,
                &job.dest,
                &job.filter,
                local_dest,
                &queue,
                &mut stats,
                &job.cancel,
            );
            queue.close();
            (result, stats)
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let shared = &shared;
            handles.push(
                std::thread::Builder::new()
                    .name(format!("copy-worker-{worker_id}"))
                    .spawn_scoped(scope, move || worker::worker_main(shared, worker_id))
                    .expect("spawning a copy worker"),
            );
        }

        let (walk_result, stats) = walker.join().expect("walker thread");
        merged.merge(&stats);
        match walk_result {
            Ok(count) => log_info!(logger, "enumerated {count} files"),
            Err(e) => {
                log_error!(logger, "source walk failed: {e}");
                walk_failed = true;
            }
        }

        for handle in handles {
            merged.merge(&handle.join().expect("worker thread"));
        }
    });
    merged.merge(&walk_stats);

    // Drain anything that never reached a worker (cancellation).
    for item in queue.drain() {
        shared.record_cancelled(item.rel);
    }

    let files = shared.into_statuses();
    summarize(job, merged, files, walk_failed, &logger)
}

fn summarize(
    job: &CopyJob,
    io: IoStats,
    files: Vec<FileStatus>,
    walk_failed: bool,
    logger: &logging::Logger,
) -> JobSummary {
    let mut stats = JobStats {
        io,
        ..JobStats::default()
    };
    let mut disk_full = false;

    for file in &files {
        match &file.outcome {
            Outcome::Copied { bytes } => {
                stats.files_copied += 1;
                stats.bytes_copied += bytes;
            }
            Outcome::Skipped => stats.files_skipped += 1,
            Outcome::Hardlinked => stats.files_linked += 1,
            Outcome::ServerHad => stats.files_server += 1,
            Outcome::ServerRaw { wire_bytes }
            | Outcome::ServerCompressed { wire_bytes }
            | Outcome::ServerDelta { wire_bytes } => {
                stats.files_server += 1;
                stats.wire_bytes += wire_bytes;
            }
            Outcome::Failed { kind } => {
                stats.files_failed += 1;
                if *kind == FailureKind::DiskFull {
                    disk_full = true;
                }
            }
        }
    }

    let exit = if walk_failed || disk_full {
        ExitStatus::Fatal
    } else if job.cancel.load(Ordering::Relaxed) {
        ExitStatus::Cancelled
    } else if stats.files_failed as usize > job.failure_tolerance {
        ExitStatus::Partial
    } else {
        ExitStatus::Ok
    };

    log_info!(
        logger,
        "copied {} ({}), skipped {}, linked {}, server {}, failed {}",
        stats.files_copied,
        logging::fmt::pretty_bytes(stats.bytes_copied),
        stats.files_skipped,
        stats.files_linked,
        stats.files_server,
        stats.files_failed
    );
    if logger.enabled(logging::Level::Debug) {
        for (name, op) in stats.io.classes() {
            if op.count > 0 {
                log_debug!(logger, "{}", logging::fmt::stats_line(name, op.time, op.count));
            }
        }
    }

    JobSummary { stats, files, exit }
}

//! Per-file outcomes, failure classification and the exit-status contract.

use fileio::{FsError, IoStats};
use protocol::ProtocolError;

/// Failure classes the recovery policy is written against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// Source file or directory disappeared.
    SourceMissing,
    /// Destination is busy; retried with backoff.
    DestinationBusy,
    /// Access denied; fails the file, job continues.
    AccessDenied,
    /// Hardlink crossed a volume boundary; falls back to a raw copy.
    CrossVolumeLink,
    /// Inode link limit reached; falls back to a raw copy.
    LinkLimit,
    /// Transient network failure; session re-established, file re-queued.
    NetworkTransient,
    /// The peer violated the protocol; session dropped.
    ProtocolViolation,
    /// A codec stream failed to decode; session dropped, file retried on a
    /// fallback path.
    CodecCorrupt,
    /// Server database inconsistency.
    DatabaseConsistency,
    /// Out of disk space; aborts the job.
    DiskFull,
    /// The job was cancelled.
    Cancelled,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Returns `true` when a bounded retry may succeed.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::DestinationBusy | Self::NetworkTransient)
    }

    /// Returns `true` when the whole job must abort.
    #[must_use]
    pub fn is_job_fatal(self) -> bool {
        matches!(self, Self::DiskFull)
    }

    /// Classifies a filesystem failure.
    #[must_use]
    pub fn from_fs(error: &FsError) -> Self {
        if error.is_not_found() {
            Self::SourceMissing
        } else if error.is_transient() {
            Self::DestinationBusy
        } else if error.is_disk_full() {
            Self::DiskFull
        } else {
            match error {
                FsError::AccessDenied { .. } => Self::AccessDenied,
                FsError::CrossVolumeLink { .. } => Self::CrossVolumeLink,
                FsError::LinkLimit { .. } => Self::LinkLimit,
                _ => Self::Other,
            }
        }
    }

    /// Classifies a protocol failure.
    #[must_use]
    pub fn from_protocol(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Io(_) => Self::NetworkTransient,
            ProtocolError::Remote { kind, .. } => match kind {
                protocol::ErrKind::DiskFull => Self::DiskFull,
                protocol::ErrKind::DatabaseConsistency => Self::DatabaseConsistency,
                protocol::ErrKind::CodecCorrupt => Self::CodecCorrupt,
                protocol::ErrKind::Cancelled => Self::Cancelled,
                _ => Self::ProtocolViolation,
            },
            _ => Self::ProtocolViolation,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SourceMissing => "source missing",
            Self::DestinationBusy => "destination busy",
            Self::AccessDenied => "access denied",
            Self::CrossVolumeLink => "cross-volume link",
            Self::LinkLimit => "link limit",
            Self::NetworkTransient => "network transient",
            Self::ProtocolViolation => "protocol violation",
            Self::CodecCorrupt => "codec corrupt",
            Self::DatabaseConsistency => "database consistency",
            Self::DiskFull => "disk full",
            Self::Cancelled => "cancelled",
            Self::Other => "error",
        };
        f.write_str(name)
    }
}

/// How one file was satisfied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Raw local copy; `bytes` went through the copy buffers.
    Copied {
        /// Bytes written.
        bytes: u64,
    },
    /// Destination already matched on (size, stamp).
    Skipped,
    /// Satisfied by a local hardlink.
    Hardlinked,
    /// The server already had the content.
    ServerHad,
    /// Streamed raw over the session.
    ServerRaw {
        /// Bulk bytes that crossed the wire.
        wire_bytes: u64,
    },
    /// Streamed compressed over the session.
    ServerCompressed {
        /// Bulk bytes that crossed the wire.
        wire_bytes: u64,
    },
    /// Sent as a delta against a server-side reference.
    ServerDelta {
        /// Bulk bytes that crossed the wire.
        wire_bytes: u64,
    },
    /// The file failed.
    Failed {
        /// Classified failure.
        kind: FailureKind,
    },
}

impl Outcome {
    /// Returns `true` for any non-failure outcome.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Note attached when a hardlink attempt fell back to a raw copy.
pub const NOTE_HARDLINK_FELL_BACK: &str = "hardlink_failed_fell_back";

/// Status of one file in the job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileStatus {
    /// Path relative to the roots.
    pub rel: String,
    /// How the file ended up.
    pub outcome: Outcome,
    /// Optional annotation, e.g. [`NOTE_HARDLINK_FELL_BACK`].
    pub note: Option<&'static str>,
}

/// Aggregated job counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct JobStats {
    /// Merged I/O statistics from every worker and the walker.
    pub io: IoStats,
    /// Raw local copies.
    pub files_copied: u64,
    /// Skips on matching key.
    pub files_skipped: u64,
    /// Local hardlinks.
    pub files_linked: u64,
    /// Files satisfied through the server session.
    pub files_server: u64,
    /// Failures.
    pub files_failed: u64,
    /// Bytes written by raw local copies.
    pub bytes_copied: u64,
    /// Bulk bytes that crossed the wire.
    pub wire_bytes: u64,
}

/// Terminal state of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Every file succeeded, or failures stayed within tolerance.
    Ok,
    /// Per-file failures exceeded the tolerance.
    Partial,
    /// The job was cancelled.
    Cancelled,
    /// Catastrophic failure: walk error, disk full, or an unusable root.
    Fatal,
}

impl ExitStatus {
    /// Process exit code exposed to callers.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Partial => 23,
            Self::Cancelled => 25,
            Self::Fatal => 30,
        }
    }
}

/// Result of [`run_copy`](crate::run_copy).
#[derive(Debug)]
pub struct JobSummary {
    /// Aggregated counters; valid even when the job aborted.
    pub stats: JobStats,
    /// Per-file status list in completion order.
    pub files: Vec<FileStatus>,
    /// Terminal state.
    pub exit: ExitStatus,
}

impl JobSummary {
    /// Process exit code for this summary.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }
}

//! Job description and policies.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use logging::Logger;

/// Bounded exponential backoff for transient per-file failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum attempts per file, including the first.
    pub attempts: u32,
    /// Initial backoff; doubles per retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(10))
    }
}

/// Per-session timeouts. Zero means unlimited.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// Connection establishment.
    pub connect: Duration,
    /// Per-operation socket idle timeout.
    pub idle: Duration,
    /// Whole-session budget.
    pub total: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            idle: Duration::from_secs(30),
            total: Duration::ZERO,
        }
    }
}

/// Feature toggles for one job.
#[derive(Clone, Copy, Debug)]
pub struct JobFlags {
    /// Offer compressed transfers to the server.
    pub compression: bool,
    /// Offer delta transfers to the server.
    pub delta: bool,
    /// Satisfy duplicate content with hardlinks.
    pub use_hardlinks: bool,
    /// Skip files whose destination matches on (size, stamp).
    pub skip_if_same_key: bool,
    /// Request the secure-copy marker during negotiation.
    pub secure_copy: bool,
    /// Walk the previous destination generation first and serve hardlinks
    /// from its key index.
    pub hardlink_prepass: bool,
}

impl Default for JobFlags {
    fn default() -> Self {
        Self {
            compression: true,
            delta: true,
            use_hardlinks: true,
            skip_if_same_key: true,
            secure_copy: false,
            hardlink_prepass: false,
        }
    }
}

/// File-inclusion predicate over root-relative paths.
#[derive(Clone, Debug, Default)]
pub struct FileFilter {
    include: Option<GlobSet>,
}

impl FileFilter {
    /// Matches every file.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches files against any of the given glob patterns.
    pub fn globs(patterns: &[&str]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            include: Some(builder.build()?),
        })
    }

    /// Tests a root-relative path.
    #[must_use]
    pub fn matches(&self, rel: &str) -> bool {
        match &self.include {
            Some(set) => set.is_match(rel),
            None => true,
        }
    }
}

/// Everything one replication run needs.
///
/// Construct with [`CopyJob::new`], adjust the public fields, then hand it
/// to [`run_copy`](crate::run_copy).
pub struct CopyJob {
    /// Absolute source root.
    pub source: PathBuf,
    /// Absolute destination root.
    pub dest: PathBuf,
    /// Inclusion predicate.
    pub filter: FileFilter,
    /// Worker thread count.
    pub workers: usize,
    /// Copy server address; local-only when `None`.
    pub server: Option<SocketAddr>,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
    /// Session timeouts.
    pub timeouts: Timeouts,
    /// Feature toggles.
    pub flags: JobFlags,
    /// Per-file failures tolerated before the job exits non-zero.
    pub failure_tolerance: usize,
    /// Key under which content fingerprints are computed; must match the
    /// server's.
    pub hash_seed: u64,
    /// Log handle threaded through every worker.
    pub logger: Logger,
    /// Cooperative cancel flag, checked between files and at chunk
    /// boundaries.
    pub cancel: Arc<AtomicBool>,
}

impl CopyJob {
    /// Creates a job with default policies and four workers.
    #[must_use]
    pub fn new(source: PathBuf, dest: PathBuf, logger: Logger) -> Self {
        Self {
            source,
            dest,
            filter: FileFilter::all(),
            workers: 4,
            server: None,
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            flags: JobFlags::default(),
            failure_tolerance: 0,
            hash_seed: 0,
            logger,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

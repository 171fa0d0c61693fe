#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `logging` is the observability layer of the EACopy workspace: a
//! process-wide [`Log`] with a dedicated drain thread, a level filter, a
//! bounded ring of recent errors for end-of-job reporting, and thread-scoped
//! [`LogScope`] contexts that tag records with a job id and can be muted
//! around best-effort operations.
//!
//! # Design
//!
//! Hot paths never block on the sink: producers format their record, append
//! it to a queue under a short lock and return. The drain thread owns the
//! sink (stderr or a log file) and renders entries as they arrive.
//! [`Logger`] is the cheap clonable handle threaded through the engine and
//! server constructors; the owning [`Log`] joins the drain thread on
//! shutdown, after the queue has been flushed.
//!
//! # Invariants
//!
//! - Records produced on one thread appear in the sink in production order.
//! - `shutdown` drains the queue completely before the drain thread exits.
//! - A muted scope suppresses emission and recent-error caching, but the
//!   error text is still captured as the scope's last error.
//!
//! # Examples
//!
//! ```
//! use logging::{Level, Log, LogConfig, LogScope, log_error, log_info};
//!
//! let log = Log::start(LogConfig::default().with_level(Level::Debug));
//! let logger = log.handle();
//!
//! let scope = LogScope::enter(Some("job-1"));
//! log_info!(logger, "starting copy of {} files", 3);
//! scope.mute();
//! log_error!(logger, "probe failed, falling back");
//! assert_eq!(scope.last_error().as_deref(), Some("probe failed, falling back"));
//! drop(scope);
//!
//! log.shutdown();
//! ```

mod context;
pub mod fmt;

pub use context::LogScope;

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Stderr, Write};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Number of recent errors retained for the end-of-job summary.
pub const RECENT_ERRORS_CAP: usize = 32;

/// Severity levels, in decreasing priority.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Level {
    /// Unexpected failures; always emitted.
    Error,
    /// Normal progress reporting.
    Info,
    /// Verbose diagnostics.
    Debug,
}

/// Configuration for [`Log::start`].
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Maximum level to emit.
    pub level: Level,
    /// Log file path; stderr when `None`.
    pub file: Option<PathBuf>,
    /// Whether to retain the recent-error ring.
    pub cache_recent_errors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            file: None,
            cache_recent_errors: true,
        }
    }
}

impl LogConfig {
    /// Sets the level filter.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Routes output to a file instead of stderr.
    #[must_use]
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file = Some(path);
        self
    }
}

struct Entry {
    text: String,
    tag: Option<Arc<str>>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    shutdown: bool,
}

struct Shared {
    level: Level,
    cache_recent_errors: bool,
    queue: Mutex<QueueState>,
    ready: Condvar,
    drained: Condvar,
    recent_errors: Mutex<VecDeque<String>>,
}

/// Owning handle for the drain thread. Construct with [`Log::start`].
pub struct Log {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Cheap clonable producer handle.
#[derive(Clone)]
pub struct Logger {
    shared: Arc<Shared>,
}

enum Sink {
    Stderr(Stderr),
    File(BufWriter<File>),
}

impl Sink {
    fn write_line(&mut self, tag: Option<&str>, text: &str) {
        let result = match (self, tag) {
            (Sink::Stderr(out), Some(tag)) => writeln!(out, "[{tag}] {text}"),
            (Sink::Stderr(out), None) => writeln!(out, "{text}"),
            (Sink::File(out), Some(tag)) => writeln!(out, "[{tag}] {text}"),
            (Sink::File(out), None) => writeln!(out, "{text}"),
        };
        // A failing sink must not take the job down with it.
        let _ = result;
    }

    fn flush(&mut self) {
        let _ = match self {
            Sink::Stderr(out) => out.flush(),
            Sink::File(out) => out.flush(),
        };
    }
}

impl Log {
    /// Starts the drain thread and returns the owning handle.
    #[must_use]
    pub fn start(config: LogConfig) -> Self {
        let shared = Arc::new(Shared {
            level: config.level,
            cache_recent_errors: config.cache_recent_errors,
            queue: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            drained: Condvar::new(),
            recent_errors: Mutex::new(VecDeque::new()),
        });

        let drain_shared = Arc::clone(&shared);
        let file = config.file;
        let thread = std::thread::Builder::new()
            .name("log-drain".into())
            .spawn(move || {
                let mut sink = match file {
                    Some(path) => match File::create(&path) {
                        Ok(f) => Sink::File(BufWriter::new(f)),
                        Err(_) => Sink::Stderr(std::io::stderr()),
                    },
                    None => Sink::Stderr(std::io::stderr()),
                };
                drain_loop(&drain_shared, &mut sink);
            })
            .expect("spawning the log drain thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Returns a producer handle.
    #[must_use]
    pub fn handle(&self) -> Logger {
        Logger {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Visits the retained recent errors, oldest first, until `visit`
    /// returns `false`.
    pub fn recent_errors(&self, mut visit: impl FnMut(&str) -> bool) {
        let recent = self
            .shared
            .recent_errors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for error in recent.iter() {
            if !visit(error) {
                break;
            }
        }
    }

    /// Drains the queue and joins the drain thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.shutdown = true;
        }
        self.shared.ready.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(shared: &Shared, sink: &mut Sink) {
    loop {
        let batch = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            while queue.entries.is_empty() && !queue.shutdown {
                queue = shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            if queue.entries.is_empty() && queue.shutdown {
                sink.flush();
                return;
            }
            std::mem::take(&mut queue.entries)
        };

        for entry in batch {
            sink.write_line(entry.tag.as_deref(), &entry.text);
        }
        sink.flush();
        shared.drained.notify_all();
    }
}

impl Logger {
    /// Returns `true` when records at `level` pass the filter.
    #[must_use]
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.shared.level
    }

    /// Emits a record at `level`. Prefer the [`log_info!`], [`log_debug!`]
    /// and [`log_error!`] macros.
    pub fn log(&self, level: Level, args: std::fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let text = args.to_string();

        if level == Level::Error {
            context::record_error(&text);
            if context::is_muted() {
                return;
            }
            if self.shared.cache_recent_errors {
                let mut recent = self
                    .shared
                    .recent_errors
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if recent.len() == RECENT_ERRORS_CAP {
                    recent.pop_front();
                }
                recent.push_back(text.clone());
            }
        }

        let entry = Entry {
            text,
            tag: context::current_tag(),
        };
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.shutdown {
                return;
            }
            queue.entries.push_back(entry);
        }
        self.shared.ready.notify_one();
    }

    /// Blocks until every queued record has reached the sink.
    pub fn flush(&self) {
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !queue.entries.is_empty() {
            let (guard, timeout) = self
                .shared
                .drained
                .wait_timeout(queue, std::time::Duration::from_millis(100))
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue = guard;
            if timeout.timed_out() && queue.entries.is_empty() {
                break;
            }
        }
    }
}

/// Emits an error record through `$logger`.
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::Level::Error, format_args!($($arg)*))
    };
}

/// Emits an info record through `$logger`.
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::Level::Info, format_args!($($arg)*))
    };
}

/// Emits a debug record through `$logger`.
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log($crate::Level::Debug, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_suppresses_debug_by_default() {
        let log = Log::start(LogConfig::default());
        let logger = log.handle();
        assert!(logger.enabled(Level::Info));
        assert!(!logger.enabled(Level::Debug));
        log.shutdown();
    }

    #[test]
    fn recent_errors_are_ring_buffered() {
        let log = Log::start(LogConfig::default());
        let logger = log.handle();
        for i in 0..RECENT_ERRORS_CAP + 5 {
            log_error!(logger, "error {i}");
        }
        logger.flush();

        let mut seen = Vec::new();
        log.recent_errors(|text| {
            seen.push(text.to_string());
            true
        });
        assert_eq!(seen.len(), RECENT_ERRORS_CAP);
        assert_eq!(seen.first().map(String::as_str), Some("error 5"));
        log.shutdown();
    }

    #[test]
    fn muted_scope_suppresses_recent_error_caching() {
        let log = Log::start(LogConfig::default());
        let logger = log.handle();

        let scope = LogScope::enter(None);
        scope.mute();
        log_error!(logger, "quiet failure");
        drop(scope);
        logger.flush();

        let mut count = 0;
        log.recent_errors(|_| {
            count += 1;
            true
        });
        assert_eq!(count, 0);
        log.shutdown();
    }

    #[test]
    fn log_file_receives_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("job.log");
        let log = Log::start(LogConfig::default().with_file(path.clone()));
        let logger = log.handle();

        let scope = LogScope::enter(Some("job-7"));
        log_info!(logger, "hello");
        drop(scope);
        log.shutdown();

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("[job-7] hello"));
    }
}

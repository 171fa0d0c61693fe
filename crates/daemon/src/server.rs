//! The listener: accepts sessions, hosts the content database and the
//! priming pool, and persists the database across restarts.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use codec::CompressionAlgorithm;
use fileio::{CopyContext, FsError, IoStats};
use hashdb::FileDatabase;
use logging::{log_error, log_info, Logger};
use protocol::FeatureFlags;

use crate::config::ServerConfig;
use crate::session::run_session;

/// Server-wide counters reported in end-of-session `STATS` frames.
#[derive(Default)]
pub(crate) struct Counters {
    pub linked: AtomicU64,
    pub delta: AtomicU64,
    pub compressed: AtomicU64,
    pub raw: AtomicU64,
    pub wire_bytes: AtomicU64,
}

/// State shared by the accept loop, every session thread and the priming
/// pool.
pub(crate) struct SharedState {
    pub db: Arc<FileDatabase>,
    pub features: FeatureFlags,
    pub compression: CompressionAlgorithm,
    pub counters: Counters,
    /// Set when the database can no longer be trusted; dedup and delta are
    /// disabled while raw copies continue.
    pub degraded: AtomicBool,
    pub logger: Logger,
}

/// A bound copy server. Call [`Server::run`] to serve until the shutdown
/// flag is raised.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    shared: Arc<SharedState>,
    shutdown: Arc<AtomicBool>,
    next_session_id: AtomicU32,
}

impl Server {
    /// Binds the listener and loads the database snapshot, if one exists.
    pub fn bind(config: ServerConfig, logger: Logger) -> Result<Self, FsError> {
        let listener = TcpListener::bind(config.bind).map_err(|e| FsError::Io {
            op: "bind",
            path: config.bind.to_string().into(),
            source: e,
        })?;
        listener.set_nonblocking(true).map_err(|e| FsError::Io {
            op: "bind",
            path: config.bind.to_string().into(),
            source: e,
        })?;

        let db = Arc::new(FileDatabase::new(config.max_history, config.hash_seed));
        if let Some(path) = &config.database_path {
            let mut stats = IoStats::default();
            match db.read_snapshot(path, &mut stats) {
                Ok(rows) => log_info!(logger, "loaded {rows} database rows from snapshot"),
                Err(hashdb::SnapshotError::Fs(e)) if e.is_not_found() => {}
                Err(e) => {
                    // Unknown or damaged snapshot: start empty, clean it up.
                    log_error!(logger, "snapshot rejected ({e}); starting empty");
                    hashdb::discard_snapshot(path, &mut stats);
                }
            }
        }

        let shared = Arc::new(SharedState {
            db,
            features: config.features,
            compression: config.compression,
            counters: Counters::default(),
            degraded: AtomicBool::new(false),
            logger: logger.clone(),
        });

        Ok(Self {
            listener,
            config,
            shared,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_session_id: AtomicU32::new(1),
        })
    }

    /// The bound address; useful when the config asked for port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Flag that stops [`Server::run`] from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Shared handle to the content database.
    #[must_use]
    pub fn database(&self) -> Arc<FileDatabase> {
        Arc::clone(&self.shared.db)
    }

    /// Serves until the shutdown flag is raised, then joins every session
    /// and prime thread and writes the database snapshot.
    pub fn run(self) {
        let logger = self.shared.logger.clone();
        log_info!(
            logger,
            "copy server listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".into())
        );

        // Priming pool: registered directories plus whatever sessions queue.
        let mut prime_threads = Vec::new();
        {
            let mut ctx = CopyContext::new();
            let mut stats = IoStats::default();
            for dir in &self.config.prime_dirs {
                if let Err(e) = self
                    .shared
                    .db
                    .prime_directory(dir, false, &mut ctx, &mut stats)
                {
                    log_error!(logger, "cannot register prime directory: {e}");
                }
            }
        }
        for worker_id in 0..self.config.prime_workers.max(1) {
            let shared = Arc::clone(&self.shared);
            let shutdown = Arc::clone(&self.shutdown);
            prime_threads.push(
                std::thread::Builder::new()
                    .name(format!("prime-{worker_id}"))
                    .spawn(move || prime_loop(&shared, &shutdown))
                    .expect("spawning a prime worker"),
            );
        }

        let mut sessions: Vec<JoinHandle<()>> = Vec::new();
        while !self.shutdown.load(Ordering::Relaxed) {
            sessions.retain(|handle| !handle.is_finished());

            if sessions.len() >= self.config.max_sessions {
                // At capacity: leave new connections in the accept backlog.
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, session_id, "accepted session");
                    let shared = Arc::clone(&self.shared);
                    sessions.push(
                        std::thread::Builder::new()
                            .name(format!("session-{session_id}"))
                            .spawn(move || run_session(stream, shared, session_id))
                            .expect("spawning a session thread"),
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log_error!(logger, "accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        for handle in sessions {
            let _ = handle.join();
        }
        for handle in prime_threads {
            let _ = handle.join();
        }

        if let Some(path) = &self.config.database_path {
            let mut stats = IoStats::default();
            match self.shared.db.write_snapshot(path, &mut stats) {
                Ok(()) => log_info!(logger, "database snapshot written"),
                Err(e) => log_error!(logger, "snapshot write failed: {e}"),
            }
        }
        log_info!(logger, "copy server stopped");
    }
}

/// One priming worker: drains the prime queue cooperatively, idling when
/// the queue is empty.
fn prime_loop(shared: &SharedState, shutdown: &AtomicBool) {
    let mut ctx = CopyContext::new();
    let mut stats = IoStats::default();
    while !shutdown.load(Ordering::Relaxed) {
        match shared.db.prime_update(&mut ctx, &mut stats) {
            Ok(true) => std::thread::sleep(Duration::from_millis(50)),
            Ok(false) => {}
            Err(e) => {
                log_error!(shared.logger, "priming failed: {e}");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

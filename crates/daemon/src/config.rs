//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use codec::CompressionAlgorithm;
use protocol::FeatureFlags;

/// Configuration for [`Server::bind`](crate::Server::bind).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on. Use port 0 to let the OS pick.
    pub bind: SocketAddr,
    /// Maximum concurrent sessions; excess connections wait in the accept
    /// backlog.
    pub max_sessions: usize,
    /// Snapshot file for the content database; in-memory only when `None`.
    pub database_path: Option<PathBuf>,
    /// Content-database row cap (0 = unlimited).
    pub max_history: usize,
    /// Directories to prime at startup.
    pub prime_dirs: Vec<PathBuf>,
    /// Threads in the priming pool.
    pub prime_workers: usize,
    /// Features this server grants to clients.
    pub features: FeatureFlags,
    /// Compression algorithm offered for compressed transfers.
    pub compression: CompressionAlgorithm,
    /// Key under which content fingerprints are computed; must match the
    /// clients'.
    pub hash_seed: u64,
}

impl ServerConfig {
    /// Defaults: all features granted, Zstandard, two prime workers.
    #[must_use]
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            max_sessions: 32,
            database_path: None,
            max_history: 500_000,
            prime_dirs: Vec::new(),
            prime_workers: 2,
            features: FeatureFlags::COMPRESSION
                .union(FeatureFlags::DELTA)
                .union(FeatureFlags::SECURE_COPY),
            compression: CompressionAlgorithm::default_zstd(),
            hash_seed: 0,
        }
    }
}

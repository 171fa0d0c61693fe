//! 128-bit content fingerprints.
//!
//! A fingerprint is computed by streaming file bytes through a keyed
//! xxh3-128 digest. The same bytes under the same key always produce the
//! same fingerprint, across threads and processes. Collision resistance is
//! assumed for honest inputs only; the protocol does not defend against
//! adversarial collisions.

use std::fmt;

use xxhash_rust::xxh3::Xxh3;

use fileio::{open_read, BufferPolicy, CopyContext, FsResult, IoStats, OpStats};

/// 128-bit content identifier as two 64-bit words.
///
/// The zero value is reserved as "no fingerprint"; the database never
/// stores it.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fingerprint {
    /// High word.
    pub first: u64,
    /// Low word.
    pub second: u64,
}

impl Fingerprint {
    /// The reserved invalid fingerprint.
    pub const ZERO: Fingerprint = Fingerprint { first: 0, second: 0 };

    /// Returns `true` unless both words are zero.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.first != 0 || self.second != 0
    }

    /// Packs both words into the 16-byte big-endian wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.first.to_be_bytes());
        out[8..].copy_from_slice(&self.second.to_be_bytes());
        out
    }

    /// Unpacks the 16-byte big-endian wire form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let first = u64::from_be_bytes(word);
        word.copy_from_slice(&bytes[8..]);
        let second = u64::from_be_bytes(word);
        Self { first, second }
    }

    fn from_u128(digest: u128) -> Self {
        Self {
            first: (digest >> 64) as u64,
            second: digest as u64,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Hashing context: the key under which fingerprints are computed, plus a
/// borrowed time/count accumulator charged by every builder.
pub struct HashContext<'a> {
    seed: u64,
    stats: &'a mut OpStats,
}

impl<'a> HashContext<'a> {
    /// Creates a context for `seed`, charging hash work into `stats`.
    pub fn new(seed: u64, stats: &'a mut OpStats) -> Self {
        Self { seed, stats }
    }

    /// The key fingerprints are computed under.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// Incremental fingerprint computation over arbitrary byte runs.
pub struct HashBuilder<'c, 'a> {
    state: Xxh3,
    context: &'c mut HashContext<'a>,
}

impl<'c, 'a> HashBuilder<'c, 'a> {
    /// Starts a new digest under the context's key.
    pub fn new(context: &'c mut HashContext<'a>) -> Self {
        let state = Xxh3::with_seed(context.seed);
        context.stats.count += 1;
        Self { state, context }
    }

    /// Feeds one byte run into the digest.
    pub fn add(&mut self, data: &[u8]) {
        let start = std::time::Instant::now();
        self.state.update(data);
        self.context.stats.time = self
            .context
            .stats
            .time
            .saturating_add(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
    }

    /// Finalizes into a fingerprint.
    #[must_use]
    pub fn finish(self) -> Fingerprint {
        Fingerprint::from_u128(self.state.digest128())
    }
}

/// One-shot helper for in-memory payloads.
#[must_use]
pub fn fingerprint_bytes(seed: u64, data: &[u8]) -> Fingerprint {
    let mut state = Xxh3::with_seed(seed);
    state.update(data);
    Fingerprint::from_u128(state.digest128())
}

/// Streams `path` through a context buffer and returns its fingerprint.
pub fn hash_file(
    path: &std::path::Path,
    seed: u64,
    ctx: &mut CopyContext,
    stats: &mut IoStats,
) -> FsResult<Fingerprint> {
    let mut reader = open_read(path, BufferPolicy::Auto, true, true, stats)?;
    let buf = ctx.scratch();

    let mut hash_stats = OpStats::default();
    let fingerprint = {
        let mut context = HashContext::new(seed, &mut hash_stats);
        let mut builder = HashBuilder::new(&mut context);
        loop {
            let read = match reader.read(buf, stats) {
                Ok(read) => read,
                Err(e) => {
                    reader.close(stats);
                    return Err(e);
                }
            };
            if read == 0 {
                break;
            }
            builder.add(&buf[..read]);
        }
        builder.finish()
    };
    reader.close(stats);
    stats.hash.merge(&hash_stats);
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_seed_same_fingerprint() {
        let a = fingerprint_bytes(7, b"deterministic");
        let b = fingerprint_bytes(7, b"deterministic");
        assert_eq!(a, b);
        assert!(a.is_valid());
    }

    #[test]
    fn different_seed_changes_the_fingerprint() {
        let a = fingerprint_bytes(1, b"payload");
        let b = fingerprint_bytes(2, b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn builder_matches_one_shot_over_split_runs() {
        let mut stats = OpStats::default();
        let mut context = HashContext::new(42, &mut stats);
        let mut builder = HashBuilder::new(&mut context);
        builder.add(b"split ");
        builder.add(b"payload");
        let split = builder.finish();

        assert_eq!(split, fingerprint_bytes(42, b"split payload"));
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn wire_bytes_round_trip() {
        let fp = fingerprint_bytes(3, b"wire");
        assert_eq!(Fingerprint::from_bytes(fp.to_bytes()), fp);
    }

    #[test]
    fn hash_file_matches_in_memory_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"file contents").expect("write");

        let mut ctx = CopyContext::new();
        let mut stats = IoStats::default();
        let fp = hash_file(&path, 9, &mut ctx, &mut stats).expect("hash");
        assert_eq!(fp, fingerprint_bytes(9, b"file contents"));
        assert_eq!(stats.hash.count, 1);
    }
}

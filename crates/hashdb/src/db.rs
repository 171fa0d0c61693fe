//! The content database: three indices under one writer lock.
//!
//! Rows are addressed by the cheap identity key `(name, stamp, size)` and
//! cross-indexed by content fingerprint for deduplication. An
//! insertion-ordered history drives eviction: when the database grows past
//! its configured maximum, the oldest rows are dropped and their on-disk
//! representatives deleted. History positions are monotonically increasing
//! sequence numbers allocated under the writer lock, so no two rows can
//! ever share a position.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, RwLock};

use rustc_hash::FxHashMap;

use fileio::{delete_file, FileStamp, IoStats};

use crate::fingerprint::Fingerprint;

/// Cheap file identity: name, last-write time, size.
///
/// Two files with equal keys are assumed to have equal content for skip
/// decisions; content equality is verified by fingerprint only when
/// explicitly requested.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileKey {
    /// Relative file name, `/`-separated.
    pub name: String,
    /// Last-write time.
    pub stamp: FileStamp,
    /// Size in bytes.
    pub size: u64,
}

impl FileKey {
    /// Builds a key.
    #[must_use]
    pub fn new(name: impl Into<String>, stamp: FileStamp, size: u64) -> Self {
        Self {
            name: name.into(),
            stamp,
            size,
        }
    }
}

/// One database row: the on-disk representative and its fingerprint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileRecord {
    /// Full path of the representative on local storage.
    pub path: PathBuf,
    /// Content fingerprint; may be [`Fingerprint::ZERO`] when unhashed.
    pub fingerprint: Fingerprint,
    seq: u64,
}

impl FileRecord {
    /// Stable history position of the row, for tie-breaking.
    #[must_use]
    pub fn history_position(&self) -> u64 {
        self.seq
    }
}

#[derive(Default)]
struct DbInner {
    by_key: BTreeMap<FileKey, FileRecord>,
    by_fingerprint: FxHashMap<Fingerprint, FileKey>,
    history: BTreeMap<u64, FileKey>,
    next_seq: u64,
}

pub(crate) struct PrimeDir {
    pub dir: PathBuf,
    pub root: PathBuf,
}

#[derive(Default)]
pub(crate) struct PrimeState {
    pub queue: VecDeque<PrimeDir>,
    pub active: u32,
}

/// Deduplicating file database shared by every server session.
///
/// Readers proceed in parallel; every mutation takes the single writer lock,
/// which totally orders database updates. No lock is held across disk I/O.
pub struct FileDatabase {
    inner: RwLock<DbInner>,
    max_history: usize,
    seed: u64,
    pub(crate) prime: Mutex<PrimeState>,
    pub(crate) prime_cond: Condvar,
}

/// Candidate size window for delta references: the reference must be within
/// a factor of this ratio of the target size, in either direction.
const DELTA_SIZE_RATIO: u64 = 4;

impl FileDatabase {
    /// Creates a database capped at `max_history` rows (0 = unlimited),
    /// fingerprinting under `seed`.
    #[must_use]
    pub fn new(max_history: usize, seed: u64) -> Self {
        Self {
            inner: RwLock::new(DbInner::default()),
            max_history,
            seed,
            prime: Mutex::new(PrimeState::default()),
            prime_cond: Condvar::new(),
        }
    }

    /// The key fingerprints are computed under.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of rows currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_key.len()
    }

    /// Returns `true` when the database holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks a row up by identity key.
    #[must_use]
    pub fn get_by_key(&self, key: &FileKey) -> Option<FileRecord> {
        self.read().by_key.get(key).cloned()
    }

    /// Looks a row up by content fingerprint.
    #[must_use]
    pub fn get_by_fingerprint(&self, fingerprint: Fingerprint) -> Option<FileRecord> {
        let inner = self.read();
        let key = inner.by_fingerprint.get(&fingerprint)?;
        inner.by_key.get(key).cloned()
    }

    /// Finds a plausible delta base for `key`: a stored row with the same
    /// name whose size falls within the ratio window. Prefers the largest
    /// candidate; on equal sizes, the most recently inserted. The row being
    /// replaced is never its own reference.
    #[must_use]
    pub fn find_delta_reference(&self, key: &FileKey) -> Option<PathBuf> {
        let inner = self.read();
        let from = FileKey::new(key.name.clone(), FileStamp::ZERO, 0);

        let mut best: Option<(&FileKey, &FileRecord)> = None;
        for (candidate, record) in inner.by_key.range(from..) {
            if candidate.name != key.name {
                break;
            }
            if candidate == key {
                continue;
            }
            if !size_within_ratio(candidate.size, key.size) {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, current_rec)) => {
                    candidate.size > current.size
                        || (candidate.size == current.size && record.seq > current_rec.seq)
                }
            };
            if better {
                best = Some((candidate, record));
            }
        }
        best.map(|(_, record)| record.path.clone())
    }

    /// Inserts or replaces the row for `key`.
    ///
    /// A re-insert with an identical fingerprint is a no-op; a differing
    /// fingerprint replaces the row and appends a fresh history entry. When
    /// the history exceeds the configured maximum the oldest rows are
    /// evicted and their representatives deleted.
    pub fn insert(
        &self,
        key: FileKey,
        fingerprint: Fingerprint,
        path: PathBuf,
        stats: &mut IoStats,
    ) {
        let evicted = {
            let mut inner = self.write();
            if let Some(existing) = inner.by_key.get(&key).cloned() {
                if existing.fingerprint == fingerprint {
                    return;
                }
                inner.history.remove(&existing.seq);
                remove_reverse_entry(&mut inner, existing.fingerprint, &key);
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.history.insert(seq, key.clone());
            if fingerprint.is_valid() {
                // First insert wins for the reverse lookup.
                inner
                    .by_fingerprint
                    .entry(fingerprint)
                    .or_insert_with(|| key.clone());
            }
            inner.by_key.insert(
                key,
                FileRecord {
                    path,
                    fingerprint,
                    seq,
                },
            );

            if self.max_history > 0 {
                evict_oldest(&mut inner, self.max_history)
            } else {
                Vec::new()
            }
        };
        delete_representatives(&evicted, stats);
    }

    /// Removes the row the reverse index points at for `fingerprint`.
    /// Used to self-heal when a representative file has vanished from
    /// disk. Returns `true` when a row was removed.
    pub fn remove_by_fingerprint(&self, fingerprint: Fingerprint) -> bool {
        let key = {
            let inner = self.read();
            inner.by_fingerprint.get(&fingerprint).cloned()
        };
        match key {
            Some(key) => {
                self.remove_by_key(&key);
                true
            }
            None => false,
        }
    }

    /// Removes the row for `key`, if present. The reverse index entry is
    /// cleared only when it points at this key.
    pub fn remove_by_key(&self, key: &FileKey) {
        let mut inner = self.write();
        let Some(record) = inner.by_key.remove(key) else {
            return;
        };
        inner.history.remove(&record.seq);
        remove_reverse_entry(&mut inner, record.fingerprint, key);
    }

    /// Evicts the oldest rows until at most `max_history` remain, deleting
    /// their on-disk representatives. Returns the number of evicted rows.
    pub fn garbage_collect(&self, max_history: usize, stats: &mut IoStats) -> usize {
        let evicted = {
            let mut inner = self.write();
            evict_oldest(&mut inner, max_history)
        };
        let count = evicted.len();
        delete_representatives(&evicted, stats);
        count
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DbInner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DbInner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Visits every row in insertion order; used by the snapshot writer.
    pub(crate) fn for_each_in_history(&self, mut visit: impl FnMut(&FileKey, &FileRecord)) {
        let inner = self.read();
        for key in inner.history.values() {
            if let Some(record) = inner.by_key.get(key) {
                visit(key, record);
            }
        }
    }
}

fn size_within_ratio(candidate: u64, target: u64) -> bool {
    if target == 0 {
        return candidate == 0;
    }
    candidate <= target.saturating_mul(DELTA_SIZE_RATIO)
        && candidate.saturating_mul(DELTA_SIZE_RATIO) >= target
}

fn remove_reverse_entry(inner: &mut DbInner, fingerprint: Fingerprint, key: &FileKey) {
    if !fingerprint.is_valid() {
        return;
    }
    if inner.by_fingerprint.get(&fingerprint) == Some(key) {
        inner.by_fingerprint.remove(&fingerprint);
    }
}

fn evict_oldest(inner: &mut DbInner, max_history: usize) -> Vec<PathBuf> {
    let mut evicted = Vec::new();
    while inner.history.len() > max_history {
        let Some((&seq, _)) = inner.history.iter().next() else {
            break;
        };
        let Some(key) = inner.history.remove(&seq) else {
            break;
        };
        if let Some(record) = inner.by_key.remove(&key) {
            remove_reverse_entry(inner, record.fingerprint, &key);
            evicted.push(record.path);
        }
    }
    evicted
}

fn delete_representatives(paths: &[PathBuf], stats: &mut IoStats) {
    for path in paths {
        // The representative may already be gone; eviction stays silent.
        let _ = delete_file(path, false, stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;

    fn key(name: &str, size: u64) -> FileKey {
        FileKey::new(name, FileStamp::from_raw(100), size)
    }

    fn fp(tag: &[u8]) -> Fingerprint {
        fingerprint_bytes(1, tag)
    }

    #[test]
    fn insert_and_lookup_by_both_indices() {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        db.insert(key("a.bin", 5), fp(b"a"), PathBuf::from("/store/a.bin"), &mut stats);

        let by_key = db.get_by_key(&key("a.bin", 5)).expect("by key");
        assert_eq!(by_key.path, PathBuf::from("/store/a.bin"));
        let by_fp = db.get_by_fingerprint(fp(b"a")).expect("by fingerprint");
        assert_eq!(by_fp.path, by_key.path);
    }

    #[test]
    fn reinsert_with_same_fingerprint_is_a_noop() {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        db.insert(key("a", 1), fp(b"a"), PathBuf::from("/one"), &mut stats);
        let first = db.get_by_key(&key("a", 1)).expect("record");
        db.insert(key("a", 1), fp(b"a"), PathBuf::from("/two"), &mut stats);
        let second = db.get_by_key(&key("a", 1)).expect("record");
        assert_eq!(first, second);
    }

    #[test]
    fn reinsert_with_new_fingerprint_replaces_and_reorders_history() {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        db.insert(key("a", 1), fp(b"v1"), PathBuf::from("/a"), &mut stats);
        db.insert(key("b", 1), fp(b"b"), PathBuf::from("/b"), &mut stats);
        db.insert(key("a", 1), fp(b"v2"), PathBuf::from("/a2"), &mut stats);

        assert_eq!(db.len(), 2);
        let record = db.get_by_key(&key("a", 1)).expect("a");
        assert_eq!(record.fingerprint, fp(b"v2"));
        assert!(db.get_by_fingerprint(fp(b"v1")).is_none());
        // The replaced row moved to the back of the history: with a cap of
        // two nothing is evicted, and `b` is now the oldest entry.
        let b = db.get_by_key(&key("b", 1)).expect("b");
        assert!(record.history_position() > b.history_position());
    }

    #[test]
    fn remove_by_key_clears_reverse_entry_only_when_owned() {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        let shared = fp(b"shared");
        db.insert(key("first", 1), shared, PathBuf::from("/first"), &mut stats);
        db.insert(key("second", 1), shared, PathBuf::from("/second"), &mut stats);

        // The reverse index points at the first insert.
        db.remove_by_key(&key("second", 1));
        assert!(db.get_by_fingerprint(shared).is_some());
        db.remove_by_key(&key("first", 1));
        assert!(db.get_by_fingerprint(shared).is_none());
    }

    #[test]
    fn garbage_collect_drops_oldest_and_deletes_representatives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();

        for i in 0..4 {
            let path = dir.path().join(format!("rep{i}"));
            std::fs::write(&path, b"x").expect("write");
            db.insert(
                key(&format!("f{i}"), 1),
                fp(format!("f{i}").as_bytes()),
                path,
                &mut stats,
            );
        }

        let evicted = db.garbage_collect(2, &mut stats);
        assert_eq!(evicted, 2);
        assert_eq!(db.len(), 2);
        assert!(!dir.path().join("rep0").exists());
        assert!(!dir.path().join("rep1").exists());
        assert!(dir.path().join("rep2").exists());
    }

    #[test]
    fn insert_evicts_past_the_configured_maximum() {
        let db = FileDatabase::new(2, 1);
        let mut stats = IoStats::default();
        for i in 0..5 {
            db.insert(
                key(&format!("f{i}"), 1),
                fp(format!("f{i}").as_bytes()),
                PathBuf::from(format!("/f{i}")),
                &mut stats,
            );
        }
        assert_eq!(db.len(), 2);
        assert!(db.get_by_key(&key("f4", 1)).is_some());
        assert!(db.get_by_key(&key("f0", 1)).is_none());
    }

    #[test]
    fn delta_reference_prefers_largest_within_window_and_skips_self() {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        let target = FileKey::new("big.bin", FileStamp::from_raw(999), 100);

        // Same name, older versions at various sizes.
        for (stamp, size, path) in [
            (1u64, 90u64, "/v1"),
            (2, 120, "/v2"),
            (3, 1000, "/too-big"),
            (4, 10, "/too-small"),
        ] {
            db.insert(
                FileKey::new("big.bin", FileStamp::from_raw(stamp), size),
                fp(path.as_bytes()),
                PathBuf::from(path),
                &mut stats,
            );
        }
        // The row being replaced must never serve as its own reference.
        db.insert(
            target.clone(),
            fp(b"self"),
            PathBuf::from("/self"),
            &mut stats,
        );

        let reference = db.find_delta_reference(&target).expect("reference");
        assert_eq!(reference, PathBuf::from("/v2"));

        assert!(db
            .find_delta_reference(&FileKey::new("other.bin", FileStamp::ZERO, 100))
            .is_none());
    }

    #[test]
    fn delta_reference_breaks_size_ties_by_recency() {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        let target = FileKey::new("f", FileStamp::from_raw(9), 100);
        db.insert(
            FileKey::new("f", FileStamp::from_raw(1), 100),
            fp(b"older"),
            PathBuf::from("/older"),
            &mut stats,
        );
        db.insert(
            FileKey::new("f", FileStamp::from_raw(2), 100),
            fp(b"newer"),
            PathBuf::from("/newer"),
            &mut stats,
        );
        assert_eq!(
            db.find_delta_reference(&target).expect("reference"),
            PathBuf::from("/newer")
        );
    }
}

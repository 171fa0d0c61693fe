//! Cumulative I/O statistics.
//!
//! Every primitive charges its wall time into an [`IoStats`] supplied by the
//! caller. Workers own a local aggregate for the duration of a job and merge
//! it into the job-global aggregate exactly once, on join, so the hot path
//! never touches shared state.

use std::time::{Duration, Instant};

/// Time/count pair for one operation class. Times are in nanoseconds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpStats {
    /// Accumulated wall time in nanoseconds.
    pub time: u64,
    /// Number of operations recorded.
    pub count: u64,
}

impl OpStats {
    /// Records one completed operation that took `elapsed`.
    pub fn record(&mut self, elapsed: Duration) {
        self.time = self.time.saturating_add(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
        self.count += 1;
    }

    /// Folds another accumulator into this one.
    pub fn merge(&mut self, other: &OpStats) {
        self.time = self.time.saturating_add(other.time);
        self.count += other.count;
    }
}

/// Runs `f`, charging its wall time and one count into `op`.
pub fn timed<T>(op: &mut OpStats, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    op.record(start.elapsed());
    result
}

/// Cumulative statistics covering the full I/O vocabulary of the engine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IoStats {
    /// Opening files for reading.
    pub open_read: OpStats,
    /// Read calls.
    pub read: OpStats,
    /// Closing read handles.
    pub close_read: OpStats,
    /// Opening files for writing.
    pub open_write: OpStats,
    /// Write calls.
    pub write: OpStats,
    /// Closing write handles.
    pub close_write: OpStats,
    /// Hardlink creation.
    pub create_link: OpStats,
    /// File deletion.
    pub delete_file: OpStats,
    /// File moves/renames.
    pub move_file: OpStats,
    /// Directory removal.
    pub remove_dir: OpStats,
    /// Last-write-time updates.
    pub set_mtime: OpStats,
    /// Directory enumeration.
    pub find_file: OpStats,
    /// Metadata queries.
    pub file_info: OpStats,
    /// Directory creation.
    pub create_dir: OpStats,
    /// Whole-file convenience copies.
    pub full_copy: OpStats,
    /// Content fingerprinting.
    pub hash: OpStats,
    /// Total bytes read from files.
    pub bytes_read: u64,
    /// Total bytes written to files.
    pub bytes_written: u64,
}

impl IoStats {
    /// Folds a worker-local aggregate into this one.
    pub fn merge(&mut self, other: &IoStats) {
        for ((_, mine), (_, theirs)) in self.classes_mut().zip(other.classes()) {
            mine.merge(&theirs);
        }
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }

    /// Iterates `(label, stats)` pairs for reporting.
    pub fn classes(&self) -> impl Iterator<Item = (&'static str, OpStats)> {
        [
            ("OpenRead", self.open_read),
            ("Read", self.read),
            ("CloseRead", self.close_read),
            ("OpenWrite", self.open_write),
            ("Write", self.write),
            ("CloseWrite", self.close_write),
            ("CreateLink", self.create_link),
            ("DeleteFile", self.delete_file),
            ("MoveFile", self.move_file),
            ("RemoveDir", self.remove_dir),
            ("SetLastWriteTime", self.set_mtime),
            ("FindFile", self.find_file),
            ("FileInfo", self.file_info),
            ("CreateDir", self.create_dir),
            ("FullCopy", self.full_copy),
            ("Hash", self.hash),
        ]
        .into_iter()
    }

    fn classes_mut(&mut self) -> impl Iterator<Item = (&'static str, &mut OpStats)> {
        [
            ("OpenRead", &mut self.open_read),
            ("Read", &mut self.read),
            ("CloseRead", &mut self.close_read),
            ("OpenWrite", &mut self.open_write),
            ("Write", &mut self.write),
            ("CloseWrite", &mut self.close_write),
            ("CreateLink", &mut self.create_link),
            ("DeleteFile", &mut self.delete_file),
            ("MoveFile", &mut self.move_file),
            ("RemoveDir", &mut self.remove_dir),
            ("SetLastWriteTime", &mut self.set_mtime),
            ("FindFile", &mut self.find_file),
            ("FileInfo", &mut self.file_info),
            ("CreateDir", &mut self.create_dir),
            ("FullCopy", &mut self.full_copy),
            ("Hash", &mut self.hash),
        ]
        .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_time_and_count() {
        let mut op = OpStats::default();
        op.record(Duration::from_nanos(100));
        op.record(Duration::from_nanos(50));
        assert_eq!(op.time, 150);
        assert_eq!(op.count, 2);
    }

    #[test]
    fn merge_folds_every_class() {
        let mut a = IoStats::default();
        let mut b = IoStats::default();
        a.read.record(Duration::from_nanos(10));
        b.read.record(Duration::from_nanos(5));
        b.write.record(Duration::from_nanos(7));
        b.bytes_written = 42;

        a.merge(&b);
        assert_eq!(a.read.count, 2);
        assert_eq!(a.read.time, 15);
        assert_eq!(a.write.count, 1);
        assert_eq!(a.bytes_written, 42);
    }

    #[test]
    fn timed_charges_the_closure() {
        let mut op = OpStats::default();
        let value = timed(&mut op, || 7);
        assert_eq!(value, 7);
        assert_eq!(op.count, 1);
    }
}

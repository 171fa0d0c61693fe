//! Database snapshot persistence.
//!
//! A snapshot starts with a 16-byte magic and a 4-byte version, followed by
//! the record count and the records in insertion order, so a reload
//! reconstructs the same history ordering. Unknown versions are rejected
//! cleanly and the server proceeds with an empty database.

use std::path::{Path, PathBuf};

use thiserror::Error;

use fileio::{
    delete_file, move_file, open_read, open_write, BufferPolicy, FileStamp, FsError, IoStats,
};

use crate::db::{FileDatabase, FileKey};
use crate::fingerprint::Fingerprint;

/// Snapshot file magic.
pub const SNAPSHOT_MAGIC: [u8; 16] = *b"EACOPY-FILEDB\0\0\0";
/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 3;

/// Failure while reading or writing a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The file does not start with the snapshot magic.
    #[error("snapshot magic mismatch")]
    BadMagic,
    /// The file carries a version this build does not understand.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    /// The file ended before the declared record count was read.
    #[error("snapshot is truncated")]
    Truncated,
    /// A stored string is not valid UTF-8.
    #[error("snapshot contains a malformed string")]
    BadString,
    /// Underlying filesystem failure.
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl FileDatabase {
    /// Serializes every row, oldest first, to `path`.
    ///
    /// The snapshot is staged in a `.tmp` sibling and renamed into place so
    /// a crash never leaves a half-written file behind.
    pub fn write_snapshot(&self, path: &Path, stats: &mut IoStats) -> Result<(), SnapshotError> {
        let tmp = tmp_path(path);
        let mut body = Vec::new();
        body.extend_from_slice(&SNAPSHOT_MAGIC);
        body.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());

        let mut count: u32 = 0;
        let mut records = Vec::new();
        self.for_each_in_history(|key, record| {
            write_string(&mut records, &key.name);
            records.extend_from_slice(&key.stamp.raw().to_be_bytes());
            records.extend_from_slice(&key.size.to_be_bytes());
            records.extend_from_slice(&record.fingerprint.to_bytes());
            write_string(&mut records, &record.path.to_string_lossy());
            count += 1;
        });
        body.extend_from_slice(&count.to_be_bytes());
        body.extend_from_slice(&records);

        let mut handle = open_write(&tmp, BufferPolicy::Auto, true, false, stats)?;
        handle.write(&body, stats)?;
        handle.close(stats)?;
        move_file(&tmp, path, stats)?;
        Ok(())
    }

    /// Restores rows from `path`, preserving their insertion order.
    /// Returns the number of rows loaded.
    pub fn read_snapshot(&self, path: &Path, stats: &mut IoStats) -> Result<usize, SnapshotError> {
        let mut handle = open_read(path, BufferPolicy::Auto, true, true, stats)?;
        let size = handle.info(stats)?.size;
        let mut data = vec![0u8; usize::try_from(size).map_err(|_| SnapshotError::Truncated)?];
        let result = handle.read_exact(&mut data, stats);
        handle.close(stats);
        result?;

        let mut cursor = Cursor { data: &data, pos: 0 };
        if cursor.take(16)? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = cursor.u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let count = cursor.u32()?;
        for _ in 0..count {
            let name = cursor.string()?;
            let stamp = FileStamp::from_raw(cursor.u64()?);
            let size = cursor.u64()?;
            let mut fp = [0u8; 16];
            fp.copy_from_slice(cursor.take(16)?);
            let rep = cursor.string()?;
            self.insert(
                FileKey::new(name, stamp, size),
                Fingerprint::from_bytes(fp),
                PathBuf::from(rep),
                stats,
            );
        }
        Ok(count as usize)
    }
}

/// Removes a stale snapshot, e.g. after a version mismatch.
pub fn discard_snapshot(path: &Path, stats: &mut IoStats) {
    let _ = delete_file(path, false, stats);
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&bytes[..len as usize]);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + len > self.data.len() {
            return Err(SnapshotError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, SnapshotError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, SnapshotError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn string(&mut self) -> Result<String, SnapshotError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SnapshotError::BadString)
    }
}

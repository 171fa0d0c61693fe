//! File handles and whole-file operations.
//!
//! Handles are thin wrappers over [`std::fs::File`] that remember their path
//! for error context and charge every call into the caller's [`IoStats`].
//! The buffered/unbuffered decision is made in exactly one place,
//! [`BufferPolicy::resolve`]; callers pass [`BufferPolicy::Auto`] unless they
//! specifically know better.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;

use crate::context::{CopyContext, COPY_BUFFER_SIZE};
use crate::error::{FsError, FsResult};
use crate::stats::{timed, IoStats};

/// Last-write time carried as 64-bit nanoseconds since the Unix epoch,
/// addressable as `(lo, hi)` 32-bit halves for the wire format. The raw
/// value round-trips verbatim through the protocol and the database
/// snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileStamp(u64);

impl FileStamp {
    /// Zero stamp, used for wildcard keys.
    pub const ZERO: FileStamp = FileStamp(0);

    /// Builds a stamp from its raw 64-bit representation.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit representation.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Reassembles a stamp from its wire halves.
    #[must_use]
    pub const fn from_parts(lo: u32, hi: u32) -> Self {
        Self(((hi as u64) << 32) | lo as u64)
    }

    /// Low 32 bits of the raw value.
    #[must_use]
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits of the raw value.
    #[must_use]
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Converts a filesystem timestamp. Times before the epoch clamp to zero.
    #[must_use]
    pub fn from_filetime(ft: FileTime) -> Self {
        let secs = ft.unix_seconds();
        if secs < 0 {
            return Self(0);
        }
        let nanos = (secs as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(u64::from(ft.nanoseconds()));
        Self(nanos)
    }

    /// Converts back to a filesystem timestamp.
    #[must_use]
    pub fn to_filetime(self) -> FileTime {
        FileTime::from_unix_time((self.0 / 1_000_000_000) as i64, (self.0 % 1_000_000_000) as u32)
    }

    /// The current wall-clock time as a stamp.
    #[must_use]
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self(nanos)
    }
}

/// Attribute bits preserved on the destination.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileAttributes {
    /// The file is read-only.
    pub read_only: bool,
    /// The entry is a directory.
    pub directory: bool,
    /// The entry is a symbolic link.
    pub symlink: bool,
}

/// Size, last-write time and attributes of a file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileInfo {
    /// Last-write time.
    pub stamp: FileStamp,
    /// Size in bytes. Zero for directories.
    pub size: u64,
    /// Preserved attribute bits.
    pub attributes: FileAttributes,
}

impl FileInfo {
    /// Builds an info from filesystem metadata.
    #[must_use]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            stamp: FileStamp::from_filetime(FileTime::from_last_modification_time(meta)),
            size: if meta.is_dir() { 0 } else { meta.len() },
            attributes: FileAttributes {
                read_only: meta.permissions().readonly(),
                directory: meta.is_dir(),
                symlink: meta.file_type().is_symlink(),
            },
        }
    }

    /// Returns `true` when size and stamp match, the cheap identity used by
    /// skip decisions.
    #[must_use]
    pub fn same_key(&self, other: &FileInfo) -> bool {
        self.size == other.size && self.stamp == other.stamp
    }
}

/// Buffered/unbuffered I/O selection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BufferPolicy {
    /// Decide from the file size: buffered below the copy-buffer size,
    /// unbuffered at or above it.
    #[default]
    Auto,
    /// Force buffered I/O.
    Buffered,
    /// Force unbuffered I/O.
    Unbuffered,
}

impl BufferPolicy {
    /// Resolves the policy for a file of `size` bytes. This is the single
    /// place where the buffered/unbuffered decision is made.
    #[must_use]
    pub fn resolve(self, size: u64) -> bool {
        match self {
            Self::Auto => size < COPY_BUFFER_SIZE as u64,
            Self::Buffered => true,
            Self::Unbuffered => false,
        }
    }
}

/// Advises the kernel about the upcoming access pattern. Advice failures are
/// ignored; they only cost prefetch efficiency.
#[cfg(unix)]
fn advise_sequential(file: &File, buffered: bool) {
    let advice = if buffered {
        rustix::fs::Advice::Sequential
    } else {
        rustix::fs::Advice::NoReuse
    };
    let _ = rustix::fs::fadvise(file, 0, 0, advice);
}

#[cfg(not(unix))]
fn advise_sequential(_file: &File, _buffered: bool) {}

/// Open file handle for reading.
#[derive(Debug)]
pub struct ReadHandle {
    file: File,
    path: PathBuf,
}

impl ReadHandle {
    /// The path the handle was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads up to `buf.len()` bytes. Short reads near EOF are in-contract.
    pub fn read(&mut self, buf: &mut [u8], stats: &mut IoStats) -> FsResult<usize> {
        let read = timed(&mut stats.read, || self.file.read(buf))
            .map_err(|e| FsError::classify("read", &self.path, e))?;
        stats.bytes_read += read as u64;
        Ok(read)
    }

    /// Fills `buf` completely or fails; used where the length is known.
    pub fn read_exact(&mut self, buf: &mut [u8], stats: &mut IoStats) -> FsResult<()> {
        timed(&mut stats.read, || self.file.read_exact(buf))
            .map_err(|e| FsError::classify("read", &self.path, e))?;
        stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Queries size and stamp from the open handle.
    pub fn info(&self, stats: &mut IoStats) -> FsResult<FileInfo> {
        let meta = timed(&mut stats.file_info, || self.file.metadata())
            .map_err(|e| FsError::classify("file-info", &self.path, e))?;
        Ok(FileInfo::from_metadata(&meta))
    }

    /// Closes the handle, charging the close into `stats`.
    pub fn close(self, stats: &mut IoStats) {
        timed(&mut stats.close_read, || drop(self.file));
    }
}

impl std::io::Seek for ReadHandle {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// Open file handle for writing.
#[derive(Debug)]
pub struct WriteHandle {
    file: File,
    path: PathBuf,
}

impl WriteHandle {
    /// The path the handle was opened at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the whole buffer.
    pub fn write(&mut self, buf: &[u8], stats: &mut IoStats) -> FsResult<()> {
        timed(&mut stats.write, || self.file.write_all(buf))
            .map_err(|e| FsError::classify("write", &self.path, e))?;
        stats.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Sets the last-write time through the open handle.
    pub fn set_mtime(&self, stamp: FileStamp, stats: &mut IoStats) -> FsResult<()> {
        timed(&mut stats.set_mtime, || {
            filetime::set_file_handle_times(&self.file, None, Some(stamp.to_filetime()))
        })
        .map_err(|e| FsError::classify("set-mtime", &self.path, e))
    }

    /// Flushes and closes the handle.
    pub fn close(self, stats: &mut IoStats) -> FsResult<()> {
        timed(&mut stats.close_write, || {
            let mut file = self.file;
            file.flush()?;
            drop(file);
            Ok(())
        })
        .map_err(|e: std::io::Error| FsError::classify("close-write", &self.path, e))
    }
}

/// Opens `path` for reading.
///
/// `sequential` requests kernel readahead; `shared_read` is advisory on
/// platforms without mandatory sharing and accepted for interface parity.
pub fn open_read(
    path: &Path,
    policy: BufferPolicy,
    sequential: bool,
    _shared_read: bool,
    stats: &mut IoStats,
) -> FsResult<ReadHandle> {
    let file = timed(&mut stats.open_read, || File::open(path))
        .map_err(|e| FsError::classify("open-read", path, e))?;
    if sequential {
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        advise_sequential(&file, policy.resolve(size));
    }
    Ok(ReadHandle {
        file,
        path: path.to_path_buf(),
    })
}

/// Opens `path` for writing.
///
/// With `create_always` the file is created or truncated; without it an
/// existing file fails with [`FsError::AlreadyExists`].
pub fn open_write(
    path: &Path,
    _policy: BufferPolicy,
    create_always: bool,
    _shared_read: bool,
    stats: &mut IoStats,
) -> FsResult<WriteHandle> {
    let mut options = OpenOptions::new();
    options.write(true);
    if create_always {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let file = timed(&mut stats.open_write, || options.open(path))
        .map_err(|e| FsError::classify("open-write", path, e))?;
    Ok(WriteHandle {
        file,
        path: path.to_path_buf(),
    })
}

/// Queries metadata without opening the file.
pub fn file_info(path: &Path, stats: &mut IoStats) -> FsResult<FileInfo> {
    let meta = timed(&mut stats.file_info, || fs::symlink_metadata(path))
        .map_err(|e| FsError::classify("file-info", path, e))?;
    Ok(FileInfo::from_metadata(&meta))
}

/// Sets the last-write time by path.
pub fn set_mtime(path: &Path, stamp: FileStamp, stats: &mut IoStats) -> FsResult<()> {
    timed(&mut stats.set_mtime, || {
        filetime::set_file_mtime(path, stamp.to_filetime())
    })
    .map_err(|e| FsError::classify("set-mtime", path, e))
}

/// Creates a hardlink at `new_path` pointing at `existing`.
///
/// Surfaces [`FsError::CrossVolumeLink`] and [`FsError::LinkLimit`] so the
/// caller can fall back to a raw copy.
pub fn create_link(existing: &Path, new_path: &Path, stats: &mut IoStats) -> FsResult<()> {
    timed(&mut stats.create_link, || fs::hard_link(existing, new_path))
        .map_err(|e| FsError::classify_link(existing, new_path, e))
}

/// Deletes a file. With `error_on_missing = false` a missing file succeeds.
pub fn delete_file(path: &Path, error_on_missing: bool, stats: &mut IoStats) -> FsResult<()> {
    let result = timed(&mut stats.delete_file, || fs::remove_file(path));
    match result {
        Ok(()) => Ok(()),
        Err(e) if !error_on_missing && e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::classify("delete-file", path, e)),
    }
}

/// Renames `source` to `dest`, replacing any existing file.
pub fn move_file(source: &Path, dest: &Path, stats: &mut IoStats) -> FsResult<()> {
    timed(&mut stats.move_file, || fs::rename(source, dest))
        .map_err(|e| FsError::classify("move-file", source, e))
}

/// Toggles the read-only bit.
pub fn set_writable(path: &Path, writable: bool) -> FsResult<()> {
    let meta = fs::metadata(path).map_err(|e| FsError::classify("file-info", path, e))?;
    let mut perms = meta.permissions();
    perms.set_readonly(!writable);
    fs::set_permissions(path, perms).map_err(|e| FsError::classify("set-writable", path, e))
}

/// Marks a file hidden. On platforms where hidden is a name convention
/// rather than an attribute bit, the flag is carried by the replicated
/// name and there is nothing to toggle; the call verifies the file exists
/// and succeeds.
pub fn set_hidden(path: &Path, _hidden: bool) -> FsResult<()> {
    fs::metadata(path)
        .map(|_| ())
        .map_err(|e| FsError::classify("set-hidden", path, e))
}

/// Creates `path` with the supplied contents and stamp in one call.
pub fn create_file(
    path: &Path,
    info: &FileInfo,
    data: &[u8],
    stats: &mut IoStats,
) -> FsResult<()> {
    let mut handle = open_write(path, BufferPolicy::Auto, true, false, stats)?;
    handle.write(data, stats)?;
    handle.set_mtime(info.stamp, stats)?;
    handle.close(stats)
}

/// Copies `source` to `dest` through the context buffers, double-buffered.
/// Returns the number of bytes copied.
pub fn copy_file(
    source: &Path,
    dest: &Path,
    source_info: &FileInfo,
    policy: BufferPolicy,
    create_always: bool,
    ctx: &mut CopyContext,
    stats: &mut IoStats,
) -> FsResult<u64> {
    let full_copy_start = std::time::Instant::now();

    let mut reader = open_read(source, policy, true, true, stats)?;
    let writer = match open_write(dest, policy, create_always, false, stats) {
        Ok(w) => w,
        Err(e) => {
            reader.close(stats);
            return Err(e);
        }
    };

    let result = copy_loop(&mut reader, writer, source_info, ctx, stats);
    reader.close(stats);
    stats.full_copy.record(full_copy_start.elapsed());
    result
}

fn copy_loop(
    reader: &mut ReadHandle,
    writer: WriteHandle,
    source_info: &FileInfo,
    ctx: &mut CopyContext,
    stats: &mut IoStats,
) -> FsResult<u64> {
    let mut overlapped = crate::overlapped::OverlappedWriter::new(writer);
    let mut total: u64 = 0;

    // Ping-pong: write buffer N while reading buffer N+1.
    let (front, back, _) = ctx.buffers();
    let mut read_buf = front;
    let mut write_buf = back;

    let mut filled = reader.read(read_buf, stats)?;
    while filled > 0 {
        std::mem::swap(&mut read_buf, &mut write_buf);
        let pending = overlapped.submit(&write_buf[..filled], stats);
        let next = reader.read(read_buf, stats);
        let written = pending.wait()?;
        total += written as u64;
        filled = next?;
    }

    let writer = overlapped.into_inner();
    writer.set_mtime(source_info.stamp, stats)?;
    writer.close(stats)?;
    Ok(total)
}

/// Ensures `path` exists as a directory, creating missing components.
///
/// With `replace_if_symlink` an existing symlink at `path` is removed and a
/// real directory created in its place. `expect_exists` short-circuits the
/// common case where the directory or its parent is already in place. Every
/// directory actually created is appended to `created` for later rollback.
pub fn ensure_directory(
    path: &Path,
    replace_if_symlink: bool,
    expect_exists: bool,
    stats: &mut IoStats,
    mut created: Option<&mut Vec<PathBuf>>,
) -> FsResult<bool> {
    if expect_exists {
        match timed(&mut stats.create_dir, || fs::create_dir(path)) {
            Ok(()) => {
                if let Some(list) = created.as_deref_mut() {
                    list.push(path.to_path_buf());
                }
                return Ok(true);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let meta = timed(&mut stats.file_info, || fs::symlink_metadata(path))
                    .map_err(|e| FsError::classify("file-info", path, e))?;
                if meta.is_dir() {
                    return Ok(false);
                }
                // Fall through to the slow path for symlink replacement.
            }
            Err(_) => {} // Parent missing; take the slow path.
        }
    }

    let mut missing: Vec<PathBuf> = Vec::new();
    let mut cursor = path;
    loop {
        match timed(&mut stats.file_info, || fs::symlink_metadata(cursor)) {
            Ok(meta) if meta.is_dir() => break,
            Ok(meta) if meta.file_type().is_symlink() && replace_if_symlink => {
                delete_file(cursor, true, stats)?;
                missing.push(cursor.to_path_buf());
                break;
            }
            Ok(_) => {
                return Err(FsError::classify(
                    "create-dir",
                    cursor,
                    std::io::Error::from(std::io::ErrorKind::AlreadyExists),
                ));
            }
            Err(_) => {
                missing.push(cursor.to_path_buf());
                match cursor.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => cursor = parent,
                    _ => break,
                }
            }
        }
    }

    let any_created = !missing.is_empty();
    for dir in missing.iter().rev() {
        match timed(&mut stats.create_dir, || fs::create_dir(dir)) {
            Ok(()) => {
                if let Some(list) = created.as_deref_mut() {
                    list.push(dir.clone());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(FsError::classify("create-dir", dir, e)),
        }
    }
    Ok(any_created)
}

/// Removes an empty directory.
pub fn remove_directory(path: &Path, stats: &mut IoStats) -> FsResult<()> {
    timed(&mut stats.remove_dir, || fs::remove_dir(path))
        .map_err(|e| FsError::classify("remove-dir", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CopyContext;

    #[test]
    fn stamp_round_trips_through_parts() {
        let stamp = FileStamp::from_raw(0x1234_5678_9abc_def0);
        assert_eq!(FileStamp::from_parts(stamp.lo(), stamp.hi()), stamp);
    }

    #[test]
    fn stamp_round_trips_through_filetime() {
        let stamp = FileStamp::from_raw(1_700_000_000_123_456_789);
        assert_eq!(FileStamp::from_filetime(stamp.to_filetime()), stamp);
    }

    #[test]
    fn auto_policy_switches_on_buffer_size() {
        assert!(BufferPolicy::Auto.resolve(COPY_BUFFER_SIZE as u64 - 1));
        assert!(!BufferPolicy::Auto.resolve(COPY_BUFFER_SIZE as u64));
        assert!(BufferPolicy::Buffered.resolve(u64::MAX));
        assert!(!BufferPolicy::Unbuffered.resolve(0));
    }

    #[test]
    fn copy_file_preserves_bytes_and_stamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, b"payload").expect("write");

        let mut stats = IoStats::default();
        let mut ctx = CopyContext::new();
        let info = file_info(&src, &mut stats).expect("info");
        let copied = copy_file(
            &src,
            &dst,
            &info,
            BufferPolicy::Auto,
            true,
            &mut ctx,
            &mut stats,
        )
        .expect("copy");

        assert_eq!(copied, 7);
        assert_eq!(fs::read(&dst).expect("read back"), b"payload");
        let dst_info = file_info(&dst, &mut stats).expect("dst info");
        assert_eq!(dst_info.stamp, info.stamp);
        assert_eq!(stats.bytes_written, 7);
    }

    #[test]
    fn open_write_respects_create_always() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("file");
        fs::write(&path, b"x").expect("write");

        let mut stats = IoStats::default();
        let err = open_write(&path, BufferPolicy::Auto, false, false, &mut stats)
            .expect_err("must refuse existing file");
        assert!(err.is_already_exists());
    }

    #[test]
    fn ensure_directory_creates_missing_chain_and_records_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let deep = dir.path().join("a/b/c");
        let mut stats = IoStats::default();
        let mut created = Vec::new();

        let did = ensure_directory(&deep, false, false, &mut stats, Some(&mut created))
            .expect("ensure");
        assert!(did);
        assert!(deep.is_dir());
        assert_eq!(created.len(), 3);

        // Idempotent on the second call.
        let did = ensure_directory(&deep, false, true, &mut stats, None).expect("ensure again");
        assert!(!did);
    }

    #[test]
    fn create_link_shares_the_inode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"shared").expect("write");

        let mut stats = IoStats::default();
        create_link(&a, &b, &mut stats).expect("link");
        assert_eq!(fs::read(&b).expect("read"), b"shared");
        assert_eq!(stats.create_link.count, 1);
    }
}

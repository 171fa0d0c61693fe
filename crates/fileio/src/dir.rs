//! Lazy directory enumeration.
//!
//! [`scan_dir`] reads one directory level, filters `.` and `..` by contract,
//! sorts entries lexicographically so traversal order is stable across
//! platforms and filesystems, and yields `(name, info)` pairs. Entry names
//! must be valid UTF-8 because they travel over the wire and into the
//! content database.

use std::fs;
use std::path::Path;

use crate::error::{FsError, FsResult};
use crate::file::FileInfo;
use crate::stats::{timed, IoStats};

/// One enumerated directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// File name relative to the scanned directory.
    pub name: String,
    /// Metadata captured at enumeration time.
    pub info: FileInfo,
}

/// Iterator over the sorted entries of one directory.
#[derive(Debug)]
pub struct DirScan {
    entries: std::vec::IntoIter<DirEntry>,
}

impl Iterator for DirScan {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        self.entries.next()
    }
}

impl ExactSizeIterator for DirScan {
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Enumerates `dir`, charging the listing into `find_file` and each metadata
/// query into `file_info`.
pub fn scan_dir(dir: &Path, stats: &mut IoStats) -> FsResult<DirScan> {
    let read = timed(&mut stats.find_file, || fs::read_dir(dir))
        .map_err(|e| FsError::classify("find-file", dir, e))?;

    let mut entries = Vec::new();
    for entry in read {
        let entry = timed(&mut stats.find_file, || entry)
            .map_err(|e| FsError::classify("find-file", dir, e))?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => {
                return Err(FsError::NonUnicodeName {
                    path: entry.path(),
                });
            }
        };
        let meta = timed(&mut stats.file_info, || entry.path().symlink_metadata())
            .map_err(|e| FsError::classify("file-info", &entry.path(), e))?;
        entries.push(DirEntry {
            name,
            info: FileInfo::from_metadata(&meta),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(DirScan {
        entries: entries.into_iter(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_yields_sorted_entries_with_info() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.txt"), b"bb").expect("write");
        fs::write(dir.path().join("a.txt"), b"a").expect("write");
        fs::create_dir(dir.path().join("sub")).expect("mkdir");

        let mut stats = IoStats::default();
        let names: Vec<_> = scan_dir(dir.path(), &mut stats)
            .expect("scan")
            .map(|e| (e.name, e.info.attributes.directory, e.info.size))
            .collect();

        assert_eq!(
            names,
            vec![
                ("a.txt".to_string(), false, 1),
                ("b.txt".to_string(), false, 2),
                ("sub".to_string(), true, 0),
            ]
        );
        assert!(stats.find_file.count >= 1);
        assert_eq!(stats.file_info.count, 3);
    }

    #[test]
    fn scan_missing_directory_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stats = IoStats::default();
        let err = scan_dir(&dir.path().join("missing"), &mut stats).expect_err("must fail");
        assert!(err.is_not_found());
    }
}

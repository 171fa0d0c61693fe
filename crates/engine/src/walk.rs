//! Source enumeration and destination-side indexing.
//!
//! A single enumerator thread traverses the source depth-first in sorted
//! order, mirrors each directory into the destination as it is discovered
//! and deposits file work items into the bounded queue. Symbolic links are
//! not followed and not replicated.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;
use tracing::debug;

use fileio::{ensure_directory, scan_dir, FileInfo, FsResult, IoStats};
use hashdb::FileKey;

use crate::job::FileFilter;
use crate::queue::BoundedQueue;

/// One file to replicate.
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Path relative to the roots, `/`-separated.
    pub rel: String,
    /// Source metadata at enumeration time.
    pub info: FileInfo,
}

/// Walks `source`, feeding `queue`. With `mirror_dirs` each discovered
/// directory is created under `dest` before its files are enqueued; a job
/// pushing to a remote server leaves directory creation to the server.
/// Returns the number of files enqueued.
pub(crate) fn walk_source(
    source: &Path,
    dest: &Path,
    filter: &FileFilter,
    mirror_dirs: bool,
    queue: &BoundedQueue<WorkItem>,
    stats: &mut IoStats,
    cancel: &AtomicBool,
) -> FsResult<u64> {
    let mut pending: Vec<String> = vec![String::new()];
    let mut enqueued = 0u64;

    while let Some(rel_dir) = pending.pop() {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let src_dir = join_rel(source, &rel_dir);
        if mirror_dirs && !rel_dir.is_empty() {
            let dst_dir = join_rel(dest, &rel_dir);
            ensure_directory(&dst_dir, true, true, stats, None)?;
        }

        let mut subdirs = Vec::new();
        for entry in scan_dir(&src_dir, stats)? {
            let rel = if rel_dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{rel_dir}/{}", entry.name)
            };
            if entry.info.attributes.symlink {
                debug!(path = %rel, "skipping symlink");
                continue;
            }
            if entry.info.attributes.directory {
                subdirs.push(rel);
            } else if filter.matches(&rel) {
                if !queue.push(WorkItem {
                    rel,
                    info: entry.info,
                }) {
                    return Ok(enqueued);
                }
                enqueued += 1;
            }
        }
        // Reverse so the stack yields subdirectories in sorted order.
        pending.extend(subdirs.into_iter().rev());
    }
    Ok(enqueued)
}

/// Joins a `/`-separated relative path onto a root.
pub(crate) fn join_rel(root: &Path, rel: &str) -> std::path::PathBuf {
    if rel.is_empty() {
        return root.to_path_buf();
    }
    let mut path = root.to_path_buf();
    for part in rel.split('/') {
        path.push(part);
    }
    path
}

/// Builds the key index of an existing destination generation for the
/// hardlink pre-pass: every file keyed by (relative name, stamp, size).
pub(crate) fn build_dest_index(
    dest: &Path,
    stats: &mut IoStats,
) -> FsResult<FxHashMap<FileKey, std::path::PathBuf>> {
    let mut index = FxHashMap::default();
    let mut pending: Vec<String> = vec![String::new()];

    while let Some(rel_dir) = pending.pop() {
        let dir = join_rel(dest, &rel_dir);
        let entries = match scan_dir(&dir, stats) {
            Ok(entries) => entries,
            // A vanished subtree just means fewer hardlink hits.
            Err(_) => continue,
        };
        for entry in entries {
            let rel = if rel_dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{rel_dir}/{}", entry.name)
            };
            if entry.info.attributes.symlink {
                continue;
            }
            if entry.info.attributes.directory {
                pending.push(rel);
            } else {
                index.insert(
                    FileKey::new(rel, entry.info.stamp, entry.info.size),
                    dir.join(&entry.name),
                );
            }
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn walk_mirrors_directories_and_enqueues_sorted_files() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        std::fs::write(src.path().join("b.txt"), b"b").expect("write");
        std::fs::write(src.path().join("a.txt"), b"a").expect("write");
        std::fs::create_dir(src.path().join("sub")).expect("mkdir");
        std::fs::write(src.path().join("sub/c.txt"), b"c").expect("write");

        let queue = Arc::new(BoundedQueue::new(16));
        let mut stats = IoStats::default();
        let cancel = AtomicBool::new(false);
        let count = walk_source(
            src.path(),
            dst.path(),
            &FileFilter::all(),
            true,
            &queue,
            &mut stats,
            &cancel,
        )
        .expect("walk");
        queue.close();

        assert_eq!(count, 3);
        assert!(dst.path().join("sub").is_dir());

        let mut rels = Vec::new();
        while let Some(item) = queue.pop() {
            rels.push(item.rel);
        }
        assert_eq!(rels, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[test]
    fn filter_limits_enqueued_files() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        std::fs::write(src.path().join("keep.bin"), b"x").expect("write");
        std::fs::write(src.path().join("drop.txt"), b"x").expect("write");

        let queue = Arc::new(BoundedQueue::new(4));
        let mut stats = IoStats::default();
        let cancel = AtomicBool::new(false);
        let filter = FileFilter::globs(&["*.bin"]).expect("globs");
        let count =
            walk_source(src.path(), dst.path(), &filter, true, &queue, &mut stats, &cancel)
                .expect("walk");
        assert_eq!(count, 1);
    }

    #[test]
    fn dest_index_keys_every_file() {
        let dst = tempfile::tempdir().expect("dst");
        std::fs::write(dst.path().join("x.bin"), b"xx").expect("write");
        std::fs::create_dir(dst.path().join("d")).expect("mkdir");
        std::fs::write(dst.path().join("d/y.bin"), b"yyy").expect("write");

        let mut stats = IoStats::default();
        let index = build_dest_index(dst.path(), &mut stats).expect("index");
        assert_eq!(index.len(), 2);
        let info = fileio::file_info(&dst.path().join("d/y.bin"), &mut stats).expect("info");
        assert_eq!(
            index.get(&FileKey::new("d/y.bin", info.stamp, 3)),
            Some(&dst.path().join("d/y.bin"))
        );
    }
}

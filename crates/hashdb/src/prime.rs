//! Background priming: pre-populating the database from directory trees.
//!
//! A registered directory is scanned one level at a time; subdirectories are
//! queued back so any number of threads can share the work by calling
//! [`FileDatabase::prime_update`] cooperatively. Each candidate file is
//! opened read-only, hashed into a fingerprint and inserted under its
//! root-relative name. Priming is idempotent and resumable: a crash mid-scan
//! leaves a partial but coherent database.

use std::path::Path;
use std::time::Duration;

use fileio::{scan_dir, CopyContext, FsResult, IoStats};

use crate::db::{FileDatabase, FileKey, PrimeDir};
use crate::fingerprint::hash_file;

impl FileDatabase {
    /// Registers `dir` for priming. With `flush` the calling thread drains
    /// the whole queue before returning.
    pub fn prime_directory(
        &self,
        dir: &Path,
        flush: bool,
        ctx: &mut CopyContext,
        stats: &mut IoStats,
    ) -> FsResult<()> {
        {
            let mut state = self.prime_lock();
            state.queue.push_back(PrimeDir {
                dir: dir.to_path_buf(),
                root: dir.to_path_buf(),
            });
        }
        self.prime_cond.notify_all();
        if flush {
            self.prime_wait(ctx, stats)?;
        }
        Ok(())
    }

    /// Performs one unit of priming work if any is queued.
    ///
    /// Returns `true` once every registered prime task has drained: no
    /// queued directories and no scan in flight on any thread.
    pub fn prime_update(&self, ctx: &mut CopyContext, stats: &mut IoStats) -> FsResult<bool> {
        let item = {
            let mut state = self.prime_lock();
            match state.queue.pop_front() {
                Some(item) => {
                    state.active += 1;
                    Some(item)
                }
                None => None,
            }
        };

        let Some(item) = item else {
            let state = self.prime_lock();
            return Ok(state.queue.is_empty() && state.active == 0);
        };

        let result = self.prime_one(&item, ctx, stats);

        let drained = {
            let mut state = self.prime_lock();
            state.active -= 1;
            state.queue.is_empty() && state.active == 0
        };
        self.prime_cond.notify_all();
        result?;
        Ok(drained)
    }

    /// Blocks until priming completes, contributing work while waiting.
    pub fn prime_wait(&self, ctx: &mut CopyContext, stats: &mut IoStats) -> FsResult<()> {
        loop {
            if self.prime_update(ctx, stats)? {
                return Ok(());
            }
            // Another thread holds the last directory; wait for it instead
            // of spinning.
            let state = self.prime_lock();
            if state.queue.is_empty() && state.active > 0 {
                let _ = self
                    .prime_cond
                    .wait_timeout(state, Duration::from_millis(20));
            }
        }
    }

    fn prime_one(&self, item: &PrimeDir, ctx: &mut CopyContext, stats: &mut IoStats) -> FsResult<()> {
        let entries: Vec<_> = scan_dir(&item.dir, stats)?.collect();
        for entry in entries {
            let full = item.dir.join(&entry.name);
            if entry.info.attributes.symlink {
                continue;
            }
            if entry.info.attributes.directory {
                {
                    let mut state = self.prime_lock();
                    state.queue.push_back(PrimeDir {
                        dir: full,
                        root: item.root.clone(),
                    });
                }
                self.prime_cond.notify_all();
                continue;
            }

            // A file that vanishes or turns unreadable mid-scan is skipped;
            // the next prime pass picks it up.
            let Ok(fingerprint) = hash_file(&full, self.seed(), ctx, stats) else {
                continue;
            };
            let name = relative_name(&item.root, &full);
            self.insert(
                FileKey::new(name, entry.info.stamp, entry.info.size),
                fingerprint,
                full,
                stats,
            );
        }
        Ok(())
    }

    fn prime_lock(&self) -> std::sync::MutexGuard<'_, crate::db::PrimeState> {
        self.prime
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Root-relative, `/`-separated name used as the database key.
fn relative_name(root: &Path, full: &Path) -> String {
    let rel = full.strip_prefix(root).unwrap_or(full);
    let mut name = String::new();
    for part in rel.components() {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&part.as_os_str().to_string_lossy());
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;

    #[test]
    fn priming_indexes_a_tree_under_relative_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("top.bin"), b"top").expect("write");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/nested.bin"), b"nested").expect("write");

        let db = FileDatabase::new(0, 5);
        let mut ctx = CopyContext::new();
        let mut stats = IoStats::default();
        db.prime_directory(dir.path(), true, &mut ctx, &mut stats)
            .expect("prime");

        assert_eq!(db.len(), 2);
        let record = db
            .get_by_fingerprint(fingerprint_bytes(5, b"nested"))
            .expect("nested row");
        assert_eq!(record.path, dir.path().join("sub/nested.bin"));

        // Keys are stored relative to the primed root.
        let info = fileio::file_info(&dir.path().join("sub/nested.bin"), &mut stats)
            .expect("info");
        assert!(db
            .get_by_key(&FileKey::new("sub/nested.bin", info.stamp, 6))
            .is_some());
    }

    #[test]
    fn prime_update_reports_drained_when_idle() {
        let db = FileDatabase::new(0, 1);
        let mut ctx = CopyContext::new();
        let mut stats = IoStats::default();
        assert!(db.prime_update(&mut ctx, &mut stats).expect("update"));
    }
}

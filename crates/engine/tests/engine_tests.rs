//! End-to-end tests for local replication runs.

use std::path::Path;
use std::sync::atomic::Ordering;

use filetime_shim::set_equal_mtimes;

use engine::{run_copy, CopyJob, ExitStatus, FileFilter, Outcome};
use logging::{Level, Log, LogConfig};

/// Sets identical last-write times so content-deduplicated files can share
/// an inode without disturbing each other's stamps.
mod filetime_shim {
    use std::path::Path;

    pub fn set_equal_mtimes(paths: &[&Path]) {
        let mut stats = fileio::IoStats::default();
        let stamp = fileio::FileStamp::now();
        for path in paths {
            fileio::set_mtime(path, stamp, &mut stats).expect("set mtime");
        }
    }
}

fn test_log() -> Log {
    Log::start(LogConfig::default().with_level(Level::Error))
}

fn single_worker_job(source: &Path, dest: &Path, logger: logging::Logger) -> CopyJob {
    let mut job = CopyJob::new(source.to_path_buf(), dest.to_path_buf(), logger);
    job.workers = 1;
    job
}

#[test]
fn cold_copy_dedups_identical_content() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");
    std::fs::write(src.path().join("a.bin"), b"hello").expect("write");
    std::fs::write(src.path().join("b.bin"), b"hello").expect("write");
    std::fs::write(src.path().join("c.bin"), b"world").expect("write");
    set_equal_mtimes(&[
        &src.path().join("a.bin"),
        &src.path().join("b.bin"),
        &src.path().join("c.bin"),
    ]);

    let log = test_log();
    let summary = run_copy(&single_worker_job(src.path(), dst.path(), log.handle()));

    assert_eq!(summary.exit, ExitStatus::Ok);
    assert_eq!(summary.stats.files_copied, 2); // a and c
    assert_eq!(summary.stats.files_linked, 1); // b links to a
    assert_eq!(summary.stats.bytes_copied, 10);
    for name in ["a.bin", "b.bin", "c.bin"] {
        assert!(dst.path().join(name).is_file(), "{name} missing");
    }
    assert_eq!(
        std::fs::read(dst.path().join("b.bin")).expect("read b"),
        b"hello"
    );
    log.shutdown();
}

#[test]
fn warm_rerun_skips_everything() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");
    std::fs::write(src.path().join("a.bin"), b"hello").expect("write");
    std::fs::write(src.path().join("b.bin"), b"hello").expect("write");
    std::fs::write(src.path().join("c.bin"), b"world").expect("write");
    set_equal_mtimes(&[
        &src.path().join("a.bin"),
        &src.path().join("b.bin"),
        &src.path().join("c.bin"),
    ]);

    let log = test_log();
    let first = run_copy(&single_worker_job(src.path(), dst.path(), log.handle()));
    assert_eq!(first.exit, ExitStatus::Ok);

    let second = run_copy(&single_worker_job(src.path(), dst.path(), log.handle()));
    assert_eq!(second.exit, ExitStatus::Ok);
    assert_eq!(second.stats.files_skipped, 3);
    assert_eq!(second.stats.files_copied, 0);
    assert_eq!(second.stats.bytes_copied, 0);
    log.shutdown();
}

#[test]
fn nested_tree_replicates_completely() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");
    std::fs::create_dir_all(src.path().join("a/b/c")).expect("mkdirs");
    std::fs::write(src.path().join("top.bin"), b"top").expect("write");
    std::fs::write(src.path().join("a/mid.bin"), b"middle").expect("write");
    std::fs::write(src.path().join("a/b/c/deep.bin"), vec![7u8; 100_000]).expect("write");

    let log = test_log();
    let mut job = single_worker_job(src.path(), dst.path(), log.handle());
    job.workers = 4;
    let summary = run_copy(&job);

    assert_eq!(summary.exit, ExitStatus::Ok);
    assert_eq!(summary.files.len(), 3);
    assert!(summary.files.iter().all(|f| f.outcome.is_success()));
    assert_eq!(
        std::fs::read(dst.path().join("a/b/c/deep.bin")).expect("read"),
        vec![7u8; 100_000]
    );
    // Every destination file carries the source mtime.
    let mut stats = fileio::IoStats::default();
    let src_info = fileio::file_info(&src.path().join("a/mid.bin"), &mut stats).expect("info");
    let dst_info = fileio::file_info(&dst.path().join("a/mid.bin"), &mut stats).expect("info");
    assert_eq!(src_info.stamp, dst_info.stamp);
    log.shutdown();
}

#[test]
fn filter_excludes_files_from_the_run() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");
    std::fs::write(src.path().join("keep.bin"), b"keep").expect("write");
    std::fs::write(src.path().join("skip.log"), b"skip").expect("write");

    let log = test_log();
    let mut job = single_worker_job(src.path(), dst.path(), log.handle());
    job.filter = FileFilter::globs(&["*.bin"]).expect("globs");
    let summary = run_copy(&job);

    assert_eq!(summary.exit, ExitStatus::Ok);
    assert!(dst.path().join("keep.bin").exists());
    assert!(!dst.path().join("skip.log").exists());
    log.shutdown();
}

#[test]
fn changed_file_is_recopied_on_rerun() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");
    std::fs::write(src.path().join("data.bin"), b"version one").expect("write");

    let log = test_log();
    run_copy(&single_worker_job(src.path(), dst.path(), log.handle()));

    std::fs::write(src.path().join("data.bin"), b"version two, longer").expect("rewrite");
    let summary = run_copy(&single_worker_job(src.path(), dst.path(), log.handle()));

    assert_eq!(summary.stats.files_copied, 1);
    assert_eq!(
        std::fs::read(dst.path().join("data.bin")).expect("read"),
        b"version two, longer"
    );
    log.shutdown();
}

#[test]
fn missing_source_root_is_fatal() {
    let dst = tempfile::tempdir().expect("dst");
    let log = test_log();
    let job = single_worker_job(Path::new("/nonexistent-source-root"), dst.path(), log.handle());
    let summary = run_copy(&job);
    assert_eq!(summary.exit, ExitStatus::Fatal);
    assert_ne!(summary.exit_code(), 0);
    log.shutdown();
}

#[test]
fn relative_roots_are_rejected() {
    let log = test_log();
    let job = CopyJob::new("relative/src".into(), "relative/dst".into(), log.handle());
    let summary = run_copy(&job);
    assert_eq!(summary.exit, ExitStatus::Fatal);
    log.shutdown();
}

#[test]
fn pre_cancelled_job_drains_without_copying() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");
    for i in 0..20 {
        std::fs::write(src.path().join(format!("f{i}.bin")), b"payload").expect("write");
    }

    let log = test_log();
    let job = single_worker_job(src.path(), dst.path(), log.handle());
    job.cancel.store(true, Ordering::Relaxed);
    let summary = run_copy(&job);

    assert_eq!(summary.exit, ExitStatus::Cancelled);
    assert_eq!(summary.stats.files_copied, 0);
    log.shutdown();
}

#[test]
fn per_file_statuses_cover_every_enumerated_file() {
    let src = tempfile::tempdir().expect("src");
    let dst = tempfile::tempdir().expect("dst");
    for i in 0..10 {
        std::fs::write(src.path().join(format!("f{i}.bin")), vec![i as u8; 64]).expect("write");
    }

    let log = test_log();
    let mut job = single_worker_job(src.path(), dst.path(), log.handle());
    job.workers = 3;
    let summary = run_copy(&job);

    assert_eq!(summary.files.len(), 10);
    for file in &summary.files {
        match &file.outcome {
            Outcome::Copied { .. } | Outcome::Hardlinked | Outcome::Skipped => {}
            other => panic!("unexpected outcome {other:?} for {}", file.rel),
        }
        assert!(dst.path().join(&file.rel).is_file());
    }
    log.shutdown();
}

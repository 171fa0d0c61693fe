//! Property tests for the database index invariants and hashing.

use std::path::PathBuf;

use proptest::prelude::*;

use fileio::{FileStamp, IoStats};
use hashdb::{fingerprint_bytes, FileDatabase, FileKey, Fingerprint};

#[derive(Clone, Debug)]
enum Op {
    Insert { name: u8, stamp: u64, size: u64, content: u8 },
    Remove { name: u8, stamp: u64, size: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, 0u64..4, 0u64..4, 0u8..8).prop_map(|(name, stamp, size, content)| Op::Insert {
            name,
            stamp,
            size,
            content,
        }),
        (0u8..6, 0u64..4, 0u64..4).prop_map(|(name, stamp, size)| Op::Remove {
            name,
            stamp,
            size
        }),
    ]
}

fn key_of(name: u8, stamp: u64, size: u64) -> FileKey {
    FileKey::new(format!("file-{name}"), FileStamp::from_raw(stamp), size)
}

/// Replays an operation sequence and checks the bijectivity invariants:
/// every reverse-index hit resolves to a present row carrying that
/// fingerprint, and the key count never exceeds the history cap.
fn check_invariants(db: &FileDatabase, fingerprints: &[Fingerprint]) {
    for &fp in fingerprints {
        if let Some(record) = db.get_by_fingerprint(fp) {
            assert_eq!(record.fingerprint, fp, "reverse index points at a row with the fingerprint");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn indices_stay_bijective_under_any_op_sequence(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        let mut fingerprints = Vec::new();

        for op in &ops {
            match *op {
                Op::Insert { name, stamp, size, content } => {
                    let fp = fingerprint_bytes(1, &[content]);
                    fingerprints.push(fp);
                    db.insert(
                        key_of(name, stamp, size),
                        fp,
                        PathBuf::from(format!("/store/{name}-{stamp}-{size}")),
                        &mut stats,
                    );
                }
                Op::Remove { name, stamp, size } => {
                    db.remove_by_key(&key_of(name, stamp, size));
                }
            }
            check_invariants(&db, &fingerprints);
        }
    }

    #[test]
    fn garbage_collect_bounds_the_key_count(
        ops in prop::collection::vec(op_strategy(), 1..40),
        cap in 0usize..8,
    ) {
        let db = FileDatabase::new(0, 1);
        let mut stats = IoStats::default();
        for op in &ops {
            if let Op::Insert { name, stamp, size, content } = *op {
                db.insert(
                    key_of(name, stamp, size),
                    fingerprint_bytes(1, &[content]),
                    PathBuf::from(format!("/store/{name}-{stamp}-{size}")),
                    &mut stats,
                );
            }
        }
        db.garbage_collect(cap, &mut stats);
        prop_assert!(db.len() <= cap);
    }

    #[test]
    fn hashing_is_deterministic(data in prop::collection::vec(any::<u8>(), 0..4096), seed in any::<u64>()) {
        let a = fingerprint_bytes(seed, &data);
        let b = fingerprint_bytes(seed, &data);
        prop_assert_eq!(a, b);
    }
}

#[test]
fn evicted_representatives_are_removed_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = FileDatabase::new(0, 1);
    let mut stats = IoStats::default();

    for i in 0..6u32 {
        let path = dir.path().join(format!("rep{i}"));
        std::fs::write(&path, b"payload").expect("write");
        db.insert(
            FileKey::new(format!("f{i}"), FileStamp::from_raw(u64::from(i)), 7),
            fingerprint_bytes(1, &i.to_be_bytes()),
            path,
            &mut stats,
        );
    }

    db.garbage_collect(3, &mut stats);
    assert_eq!(db.len(), 3);

    // Every remaining row's representative exists; every evicted one is gone.
    let mut present = 0;
    for i in 0..6u32 {
        if dir.path().join(format!("rep{i}")).exists() {
            present += 1;
        }
    }
    assert_eq!(present, 3);
}

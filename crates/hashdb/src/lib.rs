#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `hashdb` provides the content-addressed file database behind the EACopy
//! server and the fingerprinting primitives shared with the client engine.
//! Rows are indexed by a cheap identity key (name, last-write time, size)
//! and cross-indexed by a keyed 128-bit content fingerprint, enabling
//! server-side deduplication and delta-reference selection. An
//! insertion-ordered history bounds the database: the oldest rows are
//! evicted, together with their on-disk representatives, once the
//! configured maximum is exceeded.
//!
//! # Design
//!
//! - [`fingerprint`] computes fingerprints by streaming bytes through a
//!   seeded xxh3-128 digest; [`HashBuilder`] supports arbitrary byte runs
//!   and charges its work into a borrowed time/count accumulator.
//! - [`db`] holds the three indices behind a single writer lock. History
//!   positions are sequence numbers, never reused, so eviction order is
//!   total even across replacements.
//! - [`prime`] pre-populates the database from registered directory trees
//!   on whatever threads offer to help, without blocking client sessions.
//! - [`snapshot`] persists the indices in insertion order behind a
//!   magic/version header, so a restart reloads the same eviction order
//!   and an unknown format is rejected cleanly.
//!
//! # Invariants
//!
//! - Every row is referenced by exactly one history position, and every
//!   fingerprint-index entry points at a present row.
//! - The database never stores the zero fingerprint in its reverse index.
//! - All mutations are totally ordered under the writer lock; no lock is
//!   held across network or disk I/O.

pub mod db;
pub mod fingerprint;
mod prime;
pub mod snapshot;

pub use db::{FileDatabase, FileKey, FileRecord};
pub use fingerprint::{fingerprint_bytes, hash_file, Fingerprint, HashBuilder, HashContext};
pub use snapshot::{discard_snapshot, SnapshotError, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `fileio` provides the filesystem primitives shared by the EACopy copy
//! engine and copy server: buffered and unbuffered file access, overlapped
//! writes, hardlink creation, directory enumeration, last-write-time
//! preservation and idempotent directory creation. Every operation charges
//! its wall time into a caller-supplied [`IoStats`] aggregate so jobs can
//! report where their time went, per operation class.
//!
//! # Design
//!
//! - [`file`] exposes the open/read/write/close vocabulary on path-aware
//!   handles. The buffered/unbuffered choice is made in one place,
//!   [`BufferPolicy::resolve`]; callers pass [`BufferPolicy::Auto`] unless
//!   they specifically know which to request.
//! - [`overlapped`] expresses pipelined writes as an explicit submit/wait
//!   pair with at most one outstanding operation per writer, enforced by the
//!   borrow checker rather than a runtime flag.
//! - [`context`] owns the per-worker buffer set: two 8 MiB halves for the
//!   read/write ping-pong and one reserved for delta scratch.
//! - [`dir`] enumerates one directory level in stable sorted order.
//! - [`error`] classifies OS failures into the retry/fallback/fatal taxonomy
//!   the engine's recovery policy is written against.
//!
//! # Invariants
//!
//! - No operation silently swallows an error; every failure surfaces as an
//!   [`FsError`] annotated with the path involved.
//! - Statistics are only ever written through the `&mut IoStats` the caller
//!   supplies; the crate holds no global or shared state.
//! - [`CopyContext`] buffers are exclusively owned by the thread that
//!   allocated them and are never shared.
//!
//! # Errors
//!
//! All fallible operations return [`FsResult`]. Callers branch on the
//! classification helpers (`is_transient`, `is_link_fallback`,
//! `is_disk_full`, ...) instead of matching OS error codes.

pub mod context;
pub mod dir;
pub mod error;
pub mod file;
pub mod overlapped;
pub mod stats;

pub use context::{CopyContext, COPY_BUFFER_SIZE};
pub use dir::{scan_dir, DirEntry, DirScan};
pub use error::{FsError, FsResult};
pub use file::{
    copy_file, create_file, create_link, delete_file, ensure_directory, file_info, move_file,
    open_read, open_write, remove_directory, set_hidden, set_mtime, set_writable, BufferPolicy,
    FileAttributes, FileInfo, FileStamp, ReadHandle, WriteHandle,
};
pub use overlapped::{OverlappedWriter, Pending};
pub use stats::{timed, IoStats, OpStats};

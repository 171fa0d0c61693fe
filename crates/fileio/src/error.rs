//! Error taxonomy for filesystem operations.
//!
//! Every primitive in this crate reports failure through [`FsError`]. The
//! variants mirror the recovery classes the copy engine cares about: a
//! sharing violation is retried with backoff, a cross-volume link falls back
//! to a raw copy, a full disk aborts the whole job. Raw OS error codes are
//! classified once, here, so higher layers never match on errno values.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type FsResult<T> = Result<T, FsError>;

/// Failure raised by a filesystem primitive.
#[derive(Debug, Error)]
pub enum FsError {
    /// The source file or directory does not exist.
    #[error("{path}: no such file or directory")]
    NotFound {
        /// Path the operation was attempted on.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The destination already exists and overwrite was not requested.
    #[error("{path}: already exists")]
    AlreadyExists {
        /// Path the operation was attempted on.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Permission was denied by the operating system.
    #[error("{path}: access denied")]
    AccessDenied {
        /// Path the operation was attempted on.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The file is in use by another process; the caller may retry.
    #[error("{path}: sharing violation, file is busy")]
    SharingViolation {
        /// Path the operation was attempted on.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A hardlink was requested across volume boundaries.
    #[error("cannot hardlink {new_path} to {existing}: paths are on different volumes")]
    CrossVolumeLink {
        /// Path of the existing file.
        existing: PathBuf,
        /// Path the new link would have been created at.
        new_path: PathBuf,
    },
    /// The filesystem refused to add another link to the inode.
    #[error("cannot hardlink {new_path} to {existing}: link limit exceeded")]
    LinkLimit {
        /// Path of the existing file.
        existing: PathBuf,
        /// Path the new link would have been created at.
        new_path: PathBuf,
    },
    /// The volume ran out of space. Job fatal.
    #[error("{path}: no space left on device")]
    DiskFull {
        /// Path the operation was attempted on.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A path component contains bytes that are not valid UTF-8.
    #[error("{path}: file name is not valid UTF-8")]
    NonUnicodeName {
        /// Path carrying the offending component.
        path: PathBuf,
    },
    /// Any other I/O failure, annotated with the operation that raised it.
    #[error("{op} failed for {path}")]
    Io {
        /// Short name of the failing operation, e.g. `"open-read"`.
        op: &'static str,
        /// Path the operation was attempted on.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

const EXDEV: i32 = 18;
const EMLINK: i32 = 31;
const EBUSY: i32 = 16;
const ETXTBSY: i32 = 26;
const ENOSPC: i32 = 28;

impl FsError {
    /// Classifies `source` raised by `op` on `path` into a taxonomy variant.
    pub(crate) fn classify(op: &'static str, path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path, source },
            io::ErrorKind::AlreadyExists => Self::AlreadyExists { path, source },
            io::ErrorKind::PermissionDenied => Self::AccessDenied { path, source },
            _ => match source.raw_os_error() {
                Some(ENOSPC) => Self::DiskFull { path, source },
                Some(EBUSY) | Some(ETXTBSY) => Self::SharingViolation { path, source },
                _ => Self::Io { op, path, source },
            },
        }
    }

    /// Classifies a failed `link(existing, new_path)` call.
    pub(crate) fn classify_link(existing: &Path, new_path: &Path, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(EXDEV) => {
                return Self::CrossVolumeLink {
                    existing: existing.to_path_buf(),
                    new_path: new_path.to_path_buf(),
                };
            }
            Some(EMLINK) => {
                return Self::LinkLimit {
                    existing: existing.to_path_buf(),
                    new_path: new_path.to_path_buf(),
                };
            }
            _ => {}
        }
        Self::classify("create-link", new_path, source)
    }

    /// Returns `true` when retrying the operation may succeed.
    ///
    /// Only sharing violations qualify at this layer; network transience is
    /// classified by the session code that owns the socket.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SharingViolation { .. })
    }

    /// Returns `true` when the caller should fall back from a hardlink to a
    /// raw copy.
    #[must_use]
    pub fn is_link_fallback(&self) -> bool {
        matches!(self, Self::CrossVolumeLink { .. } | Self::LinkLimit { .. })
    }

    /// Returns `true` for the job-fatal out-of-space condition.
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        matches!(self, Self::DiskFull { .. })
    }

    /// Returns `true` when the referenced source is missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` when the destination already existed.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_not_found() {
        let err = FsError::classify(
            "open-read",
            Path::new("/nope"),
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn classify_link_maps_cross_volume() {
        let err = FsError::classify_link(
            Path::new("/a"),
            Path::new("/b"),
            io::Error::from_raw_os_error(EXDEV),
        );
        assert!(err.is_link_fallback());
    }

    #[test]
    fn classify_link_maps_link_limit() {
        let err = FsError::classify_link(
            Path::new("/a"),
            Path::new("/b"),
            io::Error::from_raw_os_error(EMLINK),
        );
        assert!(err.is_link_fallback());
        assert!(!err.is_disk_full());
    }
}

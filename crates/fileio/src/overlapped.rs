//! Overlapped writes as an explicit submit/wait pair.
//!
//! The surface allows at most one outstanding operation per writer: `submit`
//! returns a [`Pending`] token that mutably borrows the writer until `wait`
//! consumes it, so a second submit before the first wait does not compile.
//! The portable backend completes the write during `submit` and reports the
//! stored result from `wait`; a platform completion-port backend can slot in
//! behind the same pair without changing callers.

use std::marker::PhantomData;

use crate::error::FsResult;
use crate::file::WriteHandle;
use crate::stats::IoStats;

/// Writer with submit/wait semantics over a [`WriteHandle`].
#[derive(Debug)]
pub struct OverlappedWriter {
    handle: WriteHandle,
}

/// Completion token for one submitted write.
#[must_use = "a submitted write must be waited on"]
pub struct Pending<'w> {
    result: FsResult<usize>,
    _writer: PhantomData<&'w mut OverlappedWriter>,
}

impl OverlappedWriter {
    /// Wraps a write handle.
    #[must_use]
    pub fn new(handle: WriteHandle) -> Self {
        Self { handle }
    }

    /// Submits `buf` for writing. The returned token must be waited on
    /// before the next submit.
    pub fn submit<'w>(&'w mut self, buf: &[u8], stats: &mut IoStats) -> Pending<'w> {
        let result = self.handle.write(buf, stats).map(|()| buf.len());
        Pending {
            result,
            _writer: PhantomData,
        }
    }

    /// Unwraps the inner write handle once all writes have completed.
    #[must_use]
    pub fn into_inner(self) -> WriteHandle {
        self.handle
    }
}

impl Pending<'_> {
    /// Waits for the submitted write, returning the bytes written.
    pub fn wait(self) -> FsResult<usize> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{file_info, open_write, BufferPolicy};

    #[test]
    fn submit_then_wait_reports_bytes_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");
        let mut stats = IoStats::default();
        let handle = open_write(&path, BufferPolicy::Auto, true, false, &mut stats).expect("open");

        let mut writer = OverlappedWriter::new(handle);
        let pending = writer.submit(b"abc", &mut stats);
        assert_eq!(pending.wait().expect("wait"), 3);
        let pending = writer.submit(b"de", &mut stats);
        assert_eq!(pending.wait().expect("wait"), 2);

        writer.into_inner().close(&mut stats).expect("close");
        let info = file_info(&path, &mut stats).expect("info");
        assert_eq!(info.size, 5);
    }
}

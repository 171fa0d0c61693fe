//! Thread-scoped log contexts.
//!
//! A worker enters a [`LogScope`] at the start of a unit of work; every
//! record produced on that thread is tagged with the innermost scope's tag
//! until the scope guard drops. A scope can be muted so best-effort probes
//! (a hardlink attempt that is allowed to fail before falling back) do not
//! spill errors into the user-facing log; the error text is still captured
//! as the scope's last error for the caller to inspect.

use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

struct Frame {
    tag: Option<Arc<str>>,
    muted: bool,
    last_error: Option<String>,
}

/// RAII guard for one pushed context frame. Pops on drop.
///
/// Scopes are strictly nested per thread; the guard is intentionally not
/// `Send` so a frame cannot outlive its thread.
pub struct LogScope {
    depth: usize,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl LogScope {
    /// Pushes a new context frame, optionally tagged (typically a job id).
    #[must_use]
    pub fn enter(tag: Option<&str>) -> Self {
        let depth = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Frame {
                tag: tag.map(Arc::from),
                muted: false,
                last_error: None,
            });
            stack.len() - 1
        });
        Self {
            depth,
            _not_send: std::marker::PhantomData,
        }
    }

    /// Mutes this frame: error records are captured but not emitted.
    pub fn mute(&self) {
        STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().get_mut(self.depth) {
                frame.muted = true;
            }
        });
    }

    /// Returns the last error recorded while this frame was innermost.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        STACK.with(|stack| {
            stack
                .borrow()
                .get(self.depth)
                .and_then(|frame| frame.last_error.clone())
        })
    }

    /// Clears the recorded error.
    pub fn reset_last_error(&self) {
        STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().get_mut(self.depth) {
                frame.last_error = None;
            }
        });
    }
}

impl Drop for LogScope {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.len(), self.depth + 1, "log scopes must nest");
            stack.truncate(self.depth);
        });
    }
}

/// Tag of the innermost frame, if any.
pub(crate) fn current_tag() -> Option<Arc<str>> {
    STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .and_then(|frame| frame.tag.clone())
    })
}

/// Whether the innermost frame is muted.
pub(crate) fn is_muted() -> bool {
    STACK.with(|stack| stack.borrow().last().is_some_and(|frame| frame.muted))
}

/// Records `text` as the innermost frame's last error.
pub(crate) fn record_error(text: &str) {
    STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            frame.last_error = Some(text.to_string());
        }
    });
}

//! Pending operation handle: `cancel()` entrypoint plus the "callback fires
//! exactly once" invariant shared by every async call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Notify};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Queued,
    Dispatched,
    Completed,
    Canceled,
}

struct Inner {
    state: std::sync::Mutex<OpState>,
    completed_flag: AtomicBool,
    cancel_notify: Notify,
}

/// Handle returned by every public async call. Cloning shares the same
/// underlying state; only one side needs to call `cancel()` or observe
/// completion.
#[derive(Clone)]
pub struct PendingOp {
    inner: Arc<Inner>,
}

impl PendingOp {
    pub fn new() -> Self {
        PendingOp {
            inner: Arc::new(Inner {
                state: std::sync::Mutex::new(OpState::Queued),
                completed_flag: AtomicBool::new(false),
                cancel_notify: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> OpState {
        *self.inner.state.lock().unwrap()
    }

    pub fn mark_dispatched(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        if *guard == OpState::Queued {
            *guard = OpState::Dispatched;
        }
    }

    /// Atomically marks the op completed; returns `true` only for the
    /// caller that actually transitions it, enforcing "fires exactly once"
    /// so a caller can never observe two completions for one op.
    pub fn try_mark_completed(&self) -> bool {
        self.inner
            .completed_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Cooperative cancellation: no-op if the op already completed.
    pub fn cancel(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        if *guard == OpState::Completed {
            return;
        }
        *guard = OpState::Canceled;
        drop(guard);
        self.inner.cancel_notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.state(), OpState::Canceled)
    }

    /// Resolves when `cancel()` is called; used by session/stream loops to
    /// race against cancellation without polling.
    pub async fn canceled(&self) {
        self.inner.cancel_notify.notified().await;
    }
}

impl Default for PendingOp {
    fn default() -> Self {
        Self::new()
    }
}

/// What every public async call actually hands back: the op's cancellable
/// handle plus a way to wait for its eventual result. Dispatch itself can
/// still fail before a handle even exists (no route to the node, pool
/// exhausted) -- callers see that as a plain `Result<OpHandle<T>>` from the
/// dispatching method, with this type only covering what happens after.
pub struct OpHandle<T> {
    pending: PendingOp,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> OpHandle<T> {
    pub fn new(pending: PendingOp, rx: oneshot::Receiver<Result<T>>) -> Self {
        OpHandle { pending, rx }
    }

    pub fn state(&self) -> OpState {
        self.pending.state()
    }

    /// Requests cancellation; the in-flight call observes this the next
    /// time it's scheduled and the result this handle eventually yields
    /// becomes `RequestCanceled` unless it had already completed.
    pub fn cancel(&self) {
        self.pending.cancel();
    }

    /// Awaits the operation's result. A handle whose task was dropped
    /// without completing (the runtime shutting down mid-flight) surfaces
    /// as `RequestCanceled` rather than panicking.
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::new(ErrorKind::RequestCanceled, "operation dropped before completion")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_flag_fires_exactly_once() {
        let op = PendingOp::new();
        assert!(op.try_mark_completed());
        assert!(!op.try_mark_completed());
    }

    #[test]
    fn cancel_after_completed_is_noop() {
        let op = PendingOp::new();
        op.try_mark_completed();
        let mut guard = op.inner.state.lock().unwrap();
        *guard = OpState::Completed;
        drop(guard);
        op.cancel();
        assert_eq!(op.state(), OpState::Completed);
    }

    #[test]
    fn cancel_before_dispatch_marks_canceled() {
        let op = PendingOp::new();
        op.cancel();
        assert_eq!(op.state(), OpState::Canceled);
    }
}

//! Per-run cancellation handle

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

const RUNNING: u8 = 0;
const CANCELLING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPhase {
    Running,
    Cancelling,
    Stopped,
}

/// Running -> Cancelling -> Stopped, one way only
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    run_id: u64,
    phase: AtomicU8,
    token: CancellationToken,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                run_id: NEXT_RUN.fetch_add(1, Ordering::Relaxed),
                phase: AtomicU8::new(RUNNING),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.inner.run_id
    }

    /// Signal cancellation. Returns true only for the signal that moved the
    /// run out of `Running`; repeats are no-ops.
    pub fn cancel(&self) -> bool {
        let moved = self
            .inner
            .phase
            .compare_exchange(RUNNING, CANCELLING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            self.inner.token.cancel();
        }
        moved
    }

    /// Mark the run as over, whichever way it ended
    pub fn finish(&self) {
        self.inner.phase.store(STOPPED, Ordering::SeqCst);
    }

    pub fn phase(&self) -> CancelPhase {
        match self.inner.phase.load(Ordering::SeqCst) {
            RUNNING => CancelPhase::Running,
            CANCELLING => CancelPhase::Cancelling,
            _ => CancelPhase::Stopped,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    pub fn same_run(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = CancelHandle::new();
        assert_eq!(handle.phase(), CancelPhase::Running);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.phase(), CancelPhase::Cancelling);
        assert!(handle.token().is_cancelled());
        handle.finish();
        assert_eq!(handle.phase(), CancelPhase::Stopped);
        assert!(!handle.cancel());
    }

    #[test]
    fn test_cancel_after_finish_does_nothing() {
        let handle = CancelHandle::new();
        handle.finish();
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_runs_have_distinct_ids() {
        let a = CancelHandle::new();
        let b = CancelHandle::new();
        assert_ne!(a.run_id(), b.run_id());
        assert!(a.same_run(&a.clone()));
        assert!(!a.same_run(&b));
    }
}

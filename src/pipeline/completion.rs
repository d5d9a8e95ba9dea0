//! Tracks artifacts that have not reached a terminal state yet.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Count of in-flight artifacts with a wait-for-zero operation.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    pending: AtomicUsize,
    idle: Notify,
}

impl CompletionCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more in-flight artifact until the returned guard drops.
    #[must_use]
    pub fn track(self: &Arc<Self>) -> CompletionGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        CompletionGuard {
            counter: Arc::clone(self),
        }
    }

    /// Artifacts currently in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Waits until no artifact is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Decrements its [`CompletionCounter`] exactly once, on drop.
#[derive(Debug)]
pub struct CompletionGuard {
    counter: Arc<CompletionCounter>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.counter.release();
    }
}

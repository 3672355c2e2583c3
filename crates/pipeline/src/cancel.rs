//! Cooperative cancellation flags polled by the pipeline executor and
//! awaited by the streaming turn loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A latch-style cancellation flag. `raise()` sticks until `clear()`.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    raised: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::Acquire)
    }

    /// Resolve once the flag is raised. Returns immediately when it
    /// already is.
    pub async fn wait(&self) {
        loop {
            if self.is_raised() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after arming the waiter: a raise between the
            // check above and `notified()` must not be lost.
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

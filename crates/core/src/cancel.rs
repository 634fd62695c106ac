//! Cooperative cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cloneable cancellation signal shared between a worker and the handler code
/// it runs. Cancelling is one-way and idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // Take the lock so a waiter between its check and its wait cannot miss the wakeup.
        let _guard = self.inner.lock.lock().unwrap_or_else(|err| err.into_inner());
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block for up to `timeout`, returning early when cancelled.
    ///
    /// Returns `true` if the token is cancelled on return.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock.lock().unwrap_or_else(|err| err.into_inner());
        let (_guard, _) = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled())
            .unwrap_or_else(|err| err.into_inner());
        self.is_cancelled()
    }
}

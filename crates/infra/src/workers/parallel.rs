//! Global concurrency gate for message processing.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Bounds how many receive operations run at once across all workers.
///
/// Cloning shares the same gate.
#[derive(Debug, Clone)]
pub struct ParallelOperationsManager {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    capacity: usize,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl ParallelOperationsManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                capacity,
                in_flight: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Never blocks. The returned token says whether a slot was acquired.
    pub fn try_begin(&self) -> OperationToken {
        let mut in_flight = self.inner.lock();
        if *in_flight < self.inner.capacity {
            *in_flight += 1;
            OperationToken {
                gate: Some(self.inner.clone()),
            }
        } else {
            OperationToken { gate: None }
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.lock()
    }

    pub fn has_pending_operations(&self) -> bool {
        self.in_flight() > 0
    }

    /// Block until no slot is held or `timeout` elapses. Returns true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.inner.lock();
        while *in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            in_flight = match self.inner.idle.wait_timeout(in_flight, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl GateInner {
    // Every update is a single write under the lock; a poisoned counter is still valid.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let mut in_flight = self.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

/// Result of [`ParallelOperationsManager::try_begin`].
///
/// Releases its slot exactly once, on `dispose` or drop. A token that never
/// acquired a slot releases nothing.
#[derive(Debug)]
#[must_use = "check can_continue() and keep the token alive while working"]
pub struct OperationToken {
    gate: Option<Arc<GateInner>>,
}

impl OperationToken {
    pub fn can_continue(&self) -> bool {
        self.gate.is_some()
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl Drop for OperationToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn capacity_bounds_granted_tokens() {
        let gate = ParallelOperationsManager::new(2);

        let a = gate.try_begin();
        let b = gate.try_begin();
        let c = gate.try_begin();

        assert!(a.can_continue());
        assert!(b.can_continue());
        assert!(!c.can_continue());
        assert_eq!(gate.in_flight(), 2);
    }

    #[test]
    fn disposing_a_denied_token_frees_nothing() {
        let gate = ParallelOperationsManager::new(1);
        let held = gate.try_begin();
        let denied = gate.try_begin();

        denied.dispose();

        assert_eq!(gate.in_flight(), 1);
        assert!(!gate.try_begin().can_continue());
        drop(held);
        assert!(gate.try_begin().can_continue());
    }

    #[test]
    fn concurrent_begin_grants_exactly_capacity() {
        const CAPACITY: usize = 4;
        let gate = ParallelOperationsManager::new(CAPACITY);
        let barrier = Arc::new(Barrier::new(CAPACITY + 1));

        let threads: Vec<_> = (0..=CAPACITY)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    gate.try_begin()
                })
            })
            .collect();
        let mut tokens: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(tokens.iter().filter(|t| t.can_continue()).count(), CAPACITY);

        let granted = tokens.iter().position(OperationToken::can_continue).unwrap();
        tokens.remove(granted).dispose();
        assert!(gate.try_begin().can_continue());
    }

    #[test]
    fn wait_idle_returns_when_last_slot_is_released() {
        let gate = ParallelOperationsManager::new(1);
        let token = gate.try_begin();

        assert!(!gate.wait_idle(Duration::from_millis(10)));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.dispose();
        });
        assert!(gate.wait_idle(Duration::from_secs(5)));
        releaser.join().unwrap();
        assert!(!gate.has_pending_operations());
    }
}

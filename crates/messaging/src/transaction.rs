//! Per-receive unit of work.

use std::sync::Mutex;

use relaybus_core::{BusError, BusResult};

type Action = Box<dyn FnOnce() + Send>;

/// How a transaction ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    Aborted,
}

/// Unit of work spanning one receive attempt.
///
/// Transports hook into it: outgoing sends are deferred until commit, and a
/// received message is handed back to its queue on abort. Exactly one of
/// `commit`/`abort` takes effect; dropping an open transaction aborts it.
#[derive(Default)]
pub struct TransactionContext {
    state: Mutex<TransactionState>,
}

#[derive(Default)]
struct TransactionState {
    on_committed: Vec<Action>,
    on_aborted: Vec<Action>,
    outcome: Option<TransactionOutcome>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register work to run when the transaction commits.
    pub fn on_committed(&self, action: impl FnOnce() + Send + 'static) -> BusResult<()> {
        let mut state = self.lock()?;
        ensure_open(&state)?;
        state.on_committed.push(Box::new(action));
        Ok(())
    }

    /// Register work to run when the transaction aborts.
    pub fn on_aborted(&self, action: impl FnOnce() + Send + 'static) -> BusResult<()> {
        let mut state = self.lock()?;
        ensure_open(&state)?;
        state.on_aborted.push(Box::new(action));
        Ok(())
    }

    pub fn commit(&self) -> BusResult<()> {
        self.complete(TransactionOutcome::Committed)
    }

    pub fn abort(&self) -> BusResult<()> {
        self.complete(TransactionOutcome::Aborted)
    }

    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.state
            .lock()
            .map(|state| state.outcome)
            .unwrap_or(None)
    }

    fn complete(&self, outcome: TransactionOutcome) -> BusResult<()> {
        let actions = {
            let mut state = self.lock()?;
            if state.outcome.is_some() {
                return Ok(());
            }
            state.outcome = Some(outcome);
            let committed = std::mem::take(&mut state.on_committed);
            let aborted = std::mem::take(&mut state.on_aborted);
            match outcome {
                TransactionOutcome::Committed => committed,
                TransactionOutcome::Aborted => aborted,
            }
        };

        // Run outside the lock; actions may touch other transactions' queues.
        for action in actions {
            action();
        }
        Ok(())
    }

    fn lock(&self) -> BusResult<std::sync::MutexGuard<'_, TransactionState>> {
        self.state
            .lock()
            .map_err(|_| BusError::Poisoned("transaction context"))
    }
}

fn ensure_open(state: &TransactionState) -> BusResult<()> {
    match state.outcome {
        None => Ok(()),
        Some(outcome) => Err(BusError::transport(format!(
            "transaction already completed ({outcome:?})"
        ))),
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let _ = self.abort();
    }
}

impl core::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn commit_runs_only_commit_actions() {
        let tx = TransactionContext::new();
        let (committed, on_commit) = counter();
        let (aborted, on_abort) = counter();
        tx.on_committed(on_commit).unwrap();
        tx.on_aborted(on_abort).unwrap();

        tx.commit().unwrap();
        tx.abort().unwrap();

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(aborted.load(Ordering::SeqCst), 0);
        assert_eq!(tx.outcome(), Some(TransactionOutcome::Committed));
    }

    #[test]
    fn drop_aborts_open_transaction() {
        let (aborted, on_abort) = counter();
        {
            let tx = TransactionContext::new();
            tx.on_aborted(on_abort).unwrap();
        }
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registering_after_completion_fails() {
        let tx = TransactionContext::new();
        tx.commit().unwrap();
        assert!(tx.on_committed(|| {}).is_err());
    }
}

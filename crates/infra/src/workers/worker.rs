//! Receive loop driving transport, gate, backoff and the pipeline.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use relaybus_core::{BusResult, CancellationToken, TransportMessage};
use relaybus_messaging::{IncomingStepContext, PipelineInvoker, TransactionContext, Transport};

use crate::retry::{Disposition, RetryStep};

use super::backoff::BackoffStrategy;
use super::parallel::ParallelOperationsManager;

/// Everything the workers of one bus share.
pub struct WorkerShared {
    transport: Arc<dyn Transport>,
    invoker: Arc<PipelineInvoker>,
    retry: Arc<RetryStep>,
    gate: ParallelOperationsManager,
    backoff: Arc<dyn BackoffStrategy>,
}

impl WorkerShared {
    pub fn new(
        transport: Arc<dyn Transport>,
        invoker: Arc<PipelineInvoker>,
        retry: Arc<RetryStep>,
        gate: ParallelOperationsManager,
        backoff: Arc<dyn BackoffStrategy>,
    ) -> Self {
        Self {
            transport,
            invoker,
            retry,
            gate,
            backoff,
        }
    }

    pub fn gate(&self) -> &ParallelOperationsManager {
        &self.gate
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub handled: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    /// Receive failures and infrastructure errors during processing.
    pub errors: u64,
}

impl WorkerStats {
    pub fn accumulate(&mut self, other: &WorkerStats) {
        self.received += other.received;
        self.handled += other.handled;
        self.redelivered += other.redelivered;
        self.dead_lettered += other.dead_lettered;
        self.errors += other.errors;
    }

    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Handled => self.handled += 1,
            Disposition::Redeliver => self.redelivered += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Handle to control and join a running worker.
///
/// Dropping the handle stops the worker without waiting for it.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    cancel: CancellationToken,
    done: mpsc::Receiver<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop taking new messages and cancel in-flight handlers. Does not wait.
    pub fn signal_stop(&self) {
        let _ = self.shutdown.send(());
        self.cancel.cancel();
    }

    /// Wait up to `timeout` for the worker thread to finish. Returns false
    /// (and leaves the thread running detached) on timeout.
    pub fn wait(mut self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, ?timeout, "worker did not stop in time; detaching");
                self.join.take();
                false
            }
        }
    }

    /// Request graceful shutdown and wait (bounded) for the worker to stop.
    pub fn stop(self, timeout: Duration) -> bool {
        self.signal_stop();
        self.wait(timeout)
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.signal_stop();
        }
    }
}

/// One receive loop on a dedicated thread.
///
/// Per iteration: take a gate slot (or back off), receive, run the message
/// through the retry step and pipeline, settle the transaction, release the
/// slot. An empty queue releases the slot and applies idle backoff.
#[derive(Debug)]
pub struct Worker;

impl Worker {
    pub fn spawn(name: impl Into<String>, shared: Arc<WorkerShared>) -> WorkerHandle {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let cancel = CancellationToken::new();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = {
            let name = name.clone();
            let cancel = cancel.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    worker_loop(&name, &shared, &shutdown_rx, &cancel, &stats);
                    let _ = done_tx.send(());
                })
                .expect("failed to spawn bus worker thread")
        };

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            cancel,
            done: done_rx,
            join: Some(join),
            stats,
        }
    }
}

fn worker_loop(
    name: &str,
    shared: &WorkerShared,
    shutdown_rx: &mpsc::Receiver<()>,
    cancel: &CancellationToken,
    stats: &Mutex<WorkerStats>,
) {
    info!(worker = name, queue = shared.transport.address(), "worker started");

    loop {
        // A dropped handle counts as a stop request.
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) || cancel.is_cancelled() {
            break;
        }

        let token = shared.gate.try_begin();
        if !token.can_continue() {
            drop(token);
            shared.backoff.wait(cancel);
            continue;
        }

        let tx = Arc::new(TransactionContext::new());
        match shared.transport.receive(&tx, cancel) {
            Ok(Some(message)) => {
                shared.backoff.reset();
                update(stats, |s| s.received += 1);

                let outcome = process_message(name, shared, message, tx, cancel);
                token.dispose();

                match outcome {
                    Ok(disposition) => update(stats, |s| s.record(disposition)),
                    Err(e) => {
                        error!(worker = name, error = %e, "message processing failed");
                        update(stats, |s| s.errors += 1);
                        shared.backoff.wait_error(cancel);
                    }
                }
            }
            Ok(None) => {
                token.dispose();
                let _ = tx.commit();
                shared.backoff.wait_no_message(cancel);
            }
            Err(e) => {
                token.dispose();
                let _ = tx.abort();
                error!(worker = name, error = %e, "receive failed");
                update(stats, |s| s.errors += 1);
                shared.backoff.wait_error(cancel);
            }
        }
    }

    info!(worker = name, "worker stopped");
}

fn process_message(
    name: &str,
    shared: &WorkerShared,
    message: TransportMessage,
    tx: Arc<TransactionContext>,
    cancel: &CancellationToken,
) -> BusResult<Disposition> {
    let message_id = message.message_id().unwrap_or("<none>").to_string();
    let mut ctx = IncomingStepContext::new(message, tx.clone(), cancel.clone());

    let disposition = match shared.retry.process(&mut ctx, shared.invoker.incoming()) {
        Ok(disposition) => disposition,
        Err(e) => {
            let _ = tx.abort();
            return Err(e);
        }
    };

    if disposition.commits() {
        tx.commit()?;
    } else {
        tx.abort()?;
    }

    debug!(worker = name, message_id, ?disposition, "message settled");
    Ok(disposition)
}

fn update(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    let mut guard = stats.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard);
}

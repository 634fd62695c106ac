//! Bus host: wires transport, pipeline, retry handling and workers together.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use relaybus_core::{BusError, BusResult, CancellationToken, Clock, SystemClock, TransportMessage};
use relaybus_messaging::{
    HandlerRegistry, OutgoingStepContext, Pipeline, PipelineInvoker, TransactionContext, Transport,
    default_pipeline,
};

use crate::config::BusConfig;
use crate::retry::{
    DefaultFailFastChecker, ErrorTracker, ExceptionInfoFactory, FailFastChecker,
    InMemoryErrorTracker, RetryStep, TextExceptionInfoFactory,
};
use crate::workers::{
    BackoffStrategy, DefaultBackoffStrategy, ParallelOperationsManager, Worker, WorkerHandle,
    WorkerShared, WorkerStats,
};

type PipelineCustomizer = Box<dyn FnOnce(&mut Pipeline) -> BusResult<()> + Send>;

/// Builder for a [`Bus`]. Every collaborator has a default; override the
/// ones you need before `start`.
pub struct BusBuilder {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    fail_fast: Arc<dyn FailFastChecker>,
    factory: Option<Arc<dyn ExceptionInfoFactory>>,
    tracker: Option<Arc<dyn ErrorTracker>>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    customizers: Vec<PipelineCustomizer>,
}

impl BusBuilder {
    pub fn new(
        config: BusConfig,
        transport: Arc<dyn Transport>,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            clock: Arc::new(SystemClock),
            fail_fast: Arc::new(DefaultFailFastChecker::new()),
            factory: None,
            tracker: None,
            backoff: None,
            customizers: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fail_fast_checker(mut self, checker: Arc<dyn FailFastChecker>) -> Self {
        self.fail_fast = checker;
        self
    }

    pub fn with_exception_factory(mut self, factory: Arc<dyn ExceptionInfoFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_error_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Adjust the default pipeline, e.g. inject a step before dispatch.
    pub fn configure_pipeline<F>(mut self, customize: F) -> Self
    where
        F: FnOnce(&mut Pipeline) -> BusResult<()> + Send + 'static,
    {
        self.customizers.push(Box::new(customize));
        self
    }

    pub fn start(self) -> BusResult<Bus> {
        let config = self.config;
        config.validate()?;
        if self.transport.address() != config.input_queue {
            return Err(BusError::config(format!(
                "transport is bound to '{}' but input_queue is '{}'",
                self.transport.address(),
                config.input_queue
            )));
        }

        let transport = self.transport;
        transport.create_queue(&config.input_queue)?;
        transport.create_queue(&config.error_queue)?;

        let clock = self.clock;
        let settings = config.retry_settings();
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(TextExceptionInfoFactory::new(clock.clone())));
        let tracker = self.tracker.unwrap_or_else(|| {
            Arc::new(InMemoryErrorTracker::new(&settings, factory.clone(), clock.clone()))
        });
        let backoff = match self.backoff {
            Some(backoff) => backoff,
            None => Arc::new(DefaultBackoffStrategy::new(
                config.backoff_times.clone(),
                config.error_wait,
                clock.clone(),
            )?),
        };

        let mut pipeline =
            default_pipeline(Arc::new(self.registry), transport.clone(), clock.clone())?;
        for customize in self.customizers {
            customize(&mut pipeline)?;
        }
        let invoker = Arc::new(PipelineInvoker::new(pipeline));

        let retry = Arc::new(RetryStep::new(
            settings,
            tracker.clone(),
            self.fail_fast,
            factory,
            transport.clone(),
            clock,
        ));
        let gate = ParallelOperationsManager::new(config.max_parallelism);
        let shared = Arc::new(WorkerShared::new(
            transport.clone(),
            invoker.clone(),
            retry,
            gate.clone(),
            backoff,
        ));

        let workers = (0..config.workers)
            .map(|i| Worker::spawn(format!("{}-worker-{i}", config.input_queue), shared.clone()))
            .collect();
        let pruner = Pruner::spawn(tracker.clone(), config.prune_interval);

        info!(
            queue = %config.input_queue,
            workers = config.workers,
            max_parallelism = config.max_parallelism,
            steps = ?invoker.incoming_names(),
            "bus started"
        );

        Ok(Bus {
            config,
            transport,
            invoker,
            gate,
            tracker,
            workers,
            pruner: Some(pruner),
        })
    }
}

/// Running bus instance.
///
/// Dropping it signals every worker to stop without waiting; call
/// [`Bus::stop`] for a bounded graceful shutdown.
pub struct Bus {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    invoker: Arc<PipelineInvoker>,
    gate: ParallelOperationsManager,
    tracker: Arc<dyn ErrorTracker>,
    workers: Vec<WorkerHandle>,
    pruner: Option<Pruner>,
}

impl Bus {
    /// Start a bus with default collaborators.
    pub fn start(
        config: BusConfig,
        transport: Arc<dyn Transport>,
        registry: HandlerRegistry,
    ) -> BusResult<Self> {
        BusBuilder::new(config, transport, registry).start()
    }

    pub fn builder(
        config: BusConfig,
        transport: Arc<dyn Transport>,
        registry: HandlerRegistry,
    ) -> BusBuilder {
        BusBuilder::new(config, transport, registry)
    }

    /// Run the outgoing pipeline for `destination` in its own transaction.
    pub fn send(&self, destination: &str, message: TransportMessage) -> BusResult<()> {
        let tx = Arc::new(TransactionContext::new());
        let mut ctx = OutgoingStepContext::new(message, vec![destination.to_string()], tx.clone());

        if let Err(e) = self.invoker.invoke_outgoing(&mut ctx) {
            tx.abort()?;
            return Err(e.downcast::<BusError>().unwrap_or_else(|e| {
                BusError::transport(format!("outgoing pipeline failed: {e:#}"))
            }));
        }
        tx.commit()
    }

    /// Send to this bus's own input queue.
    pub fn send_local(&self, message: TransportMessage) -> BusResult<()> {
        self.send(self.transport.address(), message)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn error_tracker(&self) -> &Arc<dyn ErrorTracker> {
        &self.tracker
    }

    pub fn gate(&self) -> &ParallelOperationsManager {
        &self.gate
    }

    /// Statistics summed over all workers.
    pub fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for worker in &self.workers {
            total.accumulate(&worker.stats());
        }
        total
    }

    /// Stop receiving, cancel in-flight handlers and wait up to the
    /// configured shutdown timeout. Returns false if some worker had to be
    /// abandoned.
    pub fn stop(mut self) -> bool {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        info!(queue = %self.config.input_queue, "bus stopping");

        for worker in &self.workers {
            worker.signal_stop();
        }
        if !self.gate.wait_idle(self.config.shutdown_timeout) {
            warn!(
                in_flight = self.gate.in_flight(),
                "in-flight operations still running at shutdown timeout"
            );
        }

        let mut clean = true;
        for worker in self.workers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            clean &= worker.wait(remaining);
        }
        if let Some(pruner) = self.pruner.take() {
            pruner.stop();
        }

        info!(queue = %self.config.input_queue, clean, "bus stopped");
        clean
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if let Some(pruner) = self.pruner.take() {
            pruner.cancel.cancel();
        }
    }
}

impl core::fmt::Debug for Bus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus")
            .field("queue", &self.config.input_queue)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Background thread pruning expired error records.
struct Pruner {
    cancel: CancellationToken,
    join: Option<thread::JoinHandle<()>>,
}

impl Pruner {
    fn spawn(tracker: Arc<dyn ErrorTracker>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = thread::Builder::new()
            .name("error-tracker-pruner".to_string())
            .spawn(move || {
                while !token.wait_timeout(interval) {
                    match tracker.prune_expired() {
                        Ok(0) => {}
                        Ok(pruned) => debug!(pruned, "pruned expired error records"),
                        Err(e) => warn!(error = %e, "error record pruning failed"),
                    }
                }
            })
            .expect("failed to spawn error tracker pruner thread");

        Self {
            cancel,
            join: Some(join),
        }
    }

    fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

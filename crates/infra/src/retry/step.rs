//! Retry / second-level retry / dead-letter decision for one receive.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use relaybus_core::headers::{ERROR_DETAILS, SECOND_LEVEL_RETRY, SOURCE_QUEUE};
use relaybus_core::{BusError, BusResult, Clock, ExceptionInfo, HandlerError};
use relaybus_messaging::{IncomingNext, IncomingStepContext, TransactionContext, Transport};

use super::error_tracker::ErrorTracker;
use super::exception_info::ExceptionInfoFactory;
use super::fail_fast::FailFastChecker;
use super::settings::RetryStrategySettings;

/// What the receive boundary must do with the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Handled successfully; commit.
    Handled,
    /// Attempt failed and may be retried; abort so the transport redelivers.
    Redeliver,
    /// Sent to the error queue (pending commit); commit.
    DeadLettered,
}

impl Disposition {
    /// Whether the receive transaction should commit.
    pub fn commits(self) -> bool {
        !matches!(self, Disposition::Redeliver)
    }
}

/// Wraps the incoming pipeline and turns handler failures into a
/// [`Disposition`].
///
/// Every call ends in exactly one disposition. Handler side effects (e.g.
/// outgoing sends) are scoped to the attempt that produced them: a failed
/// attempt's sends are discarded even when the message is then dead-lettered
/// and the receive transaction commits.
///
/// Infrastructure failures (tracker, transport) are returned as `BusError`
/// and must abort the receive transaction.
pub struct RetryStep {
    settings: RetryStrategySettings,
    tracker: Arc<dyn ErrorTracker>,
    fail_fast: Arc<dyn FailFastChecker>,
    factory: Arc<dyn ExceptionInfoFactory>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
}

impl RetryStep {
    pub fn new(
        settings: RetryStrategySettings,
        tracker: Arc<dyn ErrorTracker>,
        fail_fast: Arc<dyn FailFastChecker>,
        factory: Arc<dyn ExceptionInfoFactory>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            tracker,
            fail_fast,
            factory,
            transport,
            clock,
        }
    }

    pub fn settings(&self) -> &RetryStrategySettings {
        &self.settings
    }

    pub fn error_tracker(&self) -> &Arc<dyn ErrorTracker> {
        &self.tracker
    }

    pub fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: IncomingNext<'_>,
    ) -> BusResult<Disposition> {
        let Some(message_id) = ctx.message().message_id().map(str::to_string) else {
            let info = ExceptionInfo::synthetic(
                "EmptyMessageId",
                "received message carries no message id",
                self.clock.now(),
            );
            self.dead_letter(ctx, None, &info)?;
            return Ok(Disposition::DeadLettered);
        };

        let max_attempts = self.settings.max_delivery_attempts();
        if let Some(delivery_count) = ctx.message().delivery_count() {
            if delivery_count >= max_attempts {
                let info = ExceptionInfo::synthetic(
                    "DeliveryCountExceeded",
                    format!(
                        "transport delivered the message {delivery_count} times \
                         (max delivery attempts {max_attempts})"
                    ),
                    self.clock.now(),
                );
                self.dead_letter(ctx, Some(&message_id), &info)?;
                return Ok(Disposition::DeadLettered);
            }
        }

        if ctx.message().is_second_level_retry() {
            let unmarked = ctx.message().without_header(SECOND_LEVEL_RETRY);
            ctx.replace_message(unmarked);
        }

        match self.attempt(ctx, next)? {
            Ok(()) => {
                if self.tracker.failure_count(&message_id)? > 0 {
                    self.tracker.clean_up(&message_id)?;
                }
                Ok(Disposition::Handled)
            }
            Err(error) => self.handle_failure(ctx, next, &message_id, error),
        }
    }

    fn handle_failure(
        &self,
        ctx: &mut IncomingStepContext,
        next: IncomingNext<'_>,
        message_id: &str,
        error: HandlerError,
    ) -> BusResult<Disposition> {
        if interrupted_by_shutdown(ctx, &error) {
            debug!(message_id, "attempt interrupted by shutdown");
            return Ok(Disposition::Redeliver);
        }

        if self.fail_fast.should_fail_fast(message_id, &error) {
            let info = self.factory.create_info(error);
            self.dead_letter(ctx, Some(message_id), &info)?;
            return Ok(Disposition::DeadLettered);
        }

        self.tracker.register_error(message_id, error)?;
        if !self.tracker.has_failed_too_many_times(message_id)? {
            debug!(
                message_id,
                failures = self.tracker.failure_count(message_id)?,
                "message will be redelivered"
            );
            return Ok(Disposition::Redeliver);
        }

        if self.settings.second_level_retries() {
            return self.second_level_dispatch(ctx, next, message_id);
        }

        let info = self.last_tracked(message_id)?;
        self.dead_letter(ctx, Some(message_id), &info)?;
        Ok(Disposition::DeadLettered)
    }

    /// One extra dispatch of the exhausted message to opted-in handlers.
    /// Its outcome is final: success is handled, failure dead-letters.
    fn second_level_dispatch(
        &self,
        ctx: &mut IncomingStepContext,
        next: IncomingNext<'_>,
        message_id: &str,
    ) -> BusResult<Disposition> {
        let failed = self.tracker.exceptions(message_id)?;
        let marked = ctx.message().with_header(SECOND_LEVEL_RETRY, "true");
        let original = ctx.replace_message(marked);
        ctx.set_failed_exceptions(failed);
        ctx.set_second_level_retry(true);

        let outcome = self.attempt(ctx, next);

        ctx.replace_message(original);
        ctx.set_failed_exceptions(Vec::new());
        ctx.set_second_level_retry(false);

        match outcome? {
            Ok(()) => {
                info!(message_id, "message handled by second-level retry");
                self.tracker.clean_up(message_id)?;
                Ok(Disposition::Handled)
            }
            Err(error) if interrupted_by_shutdown(ctx, &error) => {
                debug!(message_id, "second-level retry interrupted by shutdown");
                Ok(Disposition::Redeliver)
            }
            Err(error) => {
                let info = self.factory.create_info(error);
                self.dead_letter(ctx, Some(message_id), &info)?;
                Ok(Disposition::DeadLettered)
            }
        }
    }

    /// Runs the rest of the pipeline inside a transaction scoped to this
    /// attempt. The scope commits with the receive transaction on success and
    /// is aborted immediately on failure.
    fn attempt(
        &self,
        ctx: &mut IncomingStepContext,
        next: IncomingNext<'_>,
    ) -> BusResult<Result<(), HandlerError>> {
        let scope = Arc::new(TransactionContext::new());
        let outer = ctx.replace_transaction(scope.clone());
        let result = next.run(ctx);
        ctx.replace_transaction(outer);

        match result {
            Ok(()) => {
                let on_commit = scope.clone();
                ctx.transaction().on_committed(move || {
                    let _ = on_commit.commit();
                })?;
                ctx.transaction().on_aborted(move || {
                    let _ = scope.abort();
                })?;
                Ok(Ok(()))
            }
            Err(error) => {
                scope.abort()?;
                Ok(Err(error))
            }
        }
    }

    fn last_tracked(&self, message_id: &str) -> BusResult<ExceptionInfo> {
        Ok(self
            .tracker
            .exceptions(message_id)?
            .pop()
            .unwrap_or_else(|| {
                ExceptionInfo::synthetic(
                    "RetriesExhausted",
                    "message failed too many times",
                    self.clock.now(),
                )
            }))
    }

    /// Queues the original message (plus failure headers) for the error queue
    /// on the receive transaction and forgets its failure history.
    fn dead_letter(
        &self,
        ctx: &IncomingStepContext,
        message_id: Option<&str>,
        info: &ExceptionInfo,
    ) -> BusResult<()> {
        let message = ctx
            .message()
            .with_header(ERROR_DETAILS, info.full_description())
            .with_header(SOURCE_QUEUE, self.transport.address());

        self.transport
            .send(self.settings.error_queue(), message, ctx.transaction())?;

        if let Some(id) = message_id {
            self.tracker.clean_up(id)?;
        }

        warn!(
            message_id = message_id.unwrap_or("<none>"),
            error_queue = self.settings.error_queue(),
            reason = info.type_name(),
            error = info.message(),
            "message dead-lettered"
        );
        Ok(())
    }
}

fn interrupted_by_shutdown(ctx: &IncomingStepContext, error: &HandlerError) -> bool {
    ctx.cancellation().is_cancelled()
        && error
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<BusError>(), Some(BusError::Cancelled)))
}

impl core::fmt::Debug for RetryStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryStep")
            .field("settings", &self.settings)
            .field("input_queue", &self.transport.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use relaybus_core::headers::{DELIVERY_COUNT, MESSAGE_ID, MESSAGE_TYPE};
    use relaybus_core::{CancellationToken, FailFastError, ManualClock, TransportMessage};
    use relaybus_messaging::{
        HandlerContext, HandlerRegistry, InMemoryNetwork, InMemoryTransport, PipelineInvoker,
        default_pipeline,
    };

    use crate::retry::{DefaultFailFastChecker, InMemoryErrorTracker, TextExceptionInfoFactory};

    struct Harness {
        network: InMemoryNetwork,
        transport: Arc<InMemoryTransport>,
        invoker: PipelineInvoker,
        step: RetryStep,
        tracker: Arc<InMemoryErrorTracker>,
    }

    impl Harness {
        fn new(settings: RetryStrategySettings, registry: HandlerRegistry) -> Self {
            Self::on(InMemoryNetwork::new(), settings, registry)
        }

        fn on(
            network: InMemoryNetwork,
            settings: RetryStrategySettings,
            registry: HandlerRegistry,
        ) -> Self {
            network.create_queue(settings.error_queue()).unwrap();
            network.create_queue("audit").unwrap();
            let transport = Arc::new(InMemoryTransport::new(network.clone(), "orders").unwrap());
            let clock = Arc::new(ManualClock::default());
            let factory = Arc::new(TextExceptionInfoFactory::new(clock.clone()));
            let tracker = Arc::new(InMemoryErrorTracker::new(
                &settings,
                factory.clone(),
                clock.clone(),
            ));
            let invoker = PipelineInvoker::new(
                default_pipeline(Arc::new(registry), transport.clone(), clock.clone()).unwrap(),
            );
            let step = RetryStep::new(
                settings,
                tracker.clone(),
                Arc::new(DefaultFailFastChecker::new()),
                factory,
                transport.clone(),
                clock,
            );
            Self {
                network,
                transport,
                invoker,
                step,
                tracker,
            }
        }

        /// One receive, settled the way the worker settles it.
        fn receive_once(&self) -> Disposition {
            let tx = Arc::new(TransactionContext::new());
            let message = self
                .transport
                .receive(&tx, &CancellationToken::new())
                .unwrap()
                .unwrap();
            let mut ctx = IncomingStepContext::new(message, tx.clone(), CancellationToken::new());
            let disposition = self.step.process(&mut ctx, self.invoker.incoming()).unwrap();
            if disposition.commits() {
                tx.commit().unwrap();
            } else {
                tx.abort().unwrap();
            }
            disposition
        }
    }

    fn order(id: &str) -> TransportMessage {
        TransportMessage::new(
            [(MESSAGE_ID, id), (MESSAGE_TYPE, "order.placed")]
                .into_iter()
                .collect(),
            b"{\"sku\":\"A-1\"}".to_vec(),
        )
    }

    fn counting(
        registry: &mut HandlerRegistry,
        result: impl Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry.register_fn("order.placed", move |_: &HandlerContext<'_>| {
            c.fetch_add(1, Ordering::SeqCst);
            result()
        });
        calls
    }

    #[test]
    fn success_is_handled_and_committed() {
        let mut registry = HandlerRegistry::new();
        let calls = counting(&mut registry, || Ok(()));
        let h = Harness::new(RetryStrategySettings::new("error", 3), registry);
        h.network.deliver("orders", order("m-1")).unwrap();

        assert_eq!(h.receive_once(), Disposition::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.network.count("orders"), 0);
        assert_eq!(h.network.count("error"), 0);
    }

    #[test]
    fn failures_below_threshold_are_redelivered() {
        let mut registry = HandlerRegistry::new();
        counting(&mut registry, || Err(anyhow!("db timeout")));
        let h = Harness::new(RetryStrategySettings::new("error", 3), registry);
        h.network.deliver("orders", order("m-1")).unwrap();

        assert_eq!(h.receive_once(), Disposition::Redeliver);
        assert_eq!(h.receive_once(), Disposition::Redeliver);

        assert_eq!(h.network.count("orders"), 1);
        assert_eq!(h.network.count("error"), 0);
        assert_eq!(h.tracker.failure_count("m-1").unwrap(), 2);
    }

    #[test]
    fn recovery_cleans_up_stale_history() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let mut registry = HandlerRegistry::new();
        counting(&mut registry, move || {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("transient"))
            } else {
                Ok(())
            }
        });
        let h = Harness::new(RetryStrategySettings::new("error", 3), registry);
        h.network.deliver("orders", order("m-1")).unwrap();

        assert_eq!(h.receive_once(), Disposition::Redeliver);
        assert_eq!(h.receive_once(), Disposition::Handled);
        assert_eq!(h.tracker.failure_count("m-1").unwrap(), 0);
    }

    #[test]
    fn fail_fast_dead_letters_on_first_failure_without_counting() {
        let mut registry = HandlerRegistry::new();
        counting(&mut registry, || Err(FailFastError::new("unknown schema version").into()));
        let h = Harness::new(RetryStrategySettings::new("error", 10), registry);
        h.network.deliver("orders", order("m-1")).unwrap();

        assert_eq!(h.receive_once(), Disposition::DeadLettered);

        let dead = h.network.take_all("error");
        assert_eq!(dead.len(), 1);
        let details = dead[0].header(ERROR_DETAILS).unwrap();
        assert!(details.starts_with("FailFastError"));
        assert!(details.contains("unknown schema version"));
        assert_eq!(dead[0].header(SOURCE_QUEUE), Some("orders"));
        assert_eq!(h.tracker.failure_count("m-1").unwrap(), 0);
    }

    #[test]
    fn message_without_id_is_dead_lettered() {
        let mut registry = HandlerRegistry::new();
        let calls = counting(&mut registry, || Ok(()));
        let h = Harness::new(RetryStrategySettings::new("error", 3), registry);
        h.network
            .deliver("orders", order("m-1").without_header(MESSAGE_ID))
            .unwrap();

        assert_eq!(h.receive_once(), Disposition::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let dead = h.network.take_all("error");
        assert!(dead[0].header(ERROR_DETAILS).unwrap().starts_with("EmptyMessageId"));
    }

    #[test]
    fn marked_message_takes_the_ordinary_path_first() {
        let seen_marker = Arc::new(AtomicUsize::new(0));
        let seen = seen_marker.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("order.placed", move |ctx: &HandlerContext<'_>| {
            if ctx.message().is_second_level_retry() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        let h = Harness::new(
            RetryStrategySettings::new("error", 5).with_second_level_retries(true),
            registry,
        );
        h.network
            .deliver("orders", order("m-1").with_header(SECOND_LEVEL_RETRY, "true"))
            .unwrap();

        assert_eq!(h.receive_once(), Disposition::Handled);
        assert_eq!(seen_marker.load(Ordering::SeqCst), 0);
        assert_eq!(h.network.count("error"), 0);
    }

    #[test]
    fn native_delivery_count_at_threshold_skips_pipeline() {
        let mut registry = HandlerRegistry::new();
        let calls = counting(&mut registry, || Ok(()));
        let h = Harness::new(RetryStrategySettings::new("error", 3), registry);
        h.network
            .deliver("orders", order("m-1").with_header(DELIVERY_COUNT, "3"))
            .unwrap();

        assert_eq!(h.receive_once(), Disposition::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(
            h.network.take_all("error")[0]
                .header(ERROR_DETAILS)
                .unwrap()
                .starts_with("DeliveryCountExceeded")
        );
    }

    fn auditing(
        network: &InMemoryNetwork,
        outcome: fn() -> Result<(), HandlerError>,
    ) -> HandlerRegistry {
        let side = InMemoryTransport::new(network.clone(), "orders-side").unwrap();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("order.placed", move |ctx: &HandlerContext<'_>| {
            let audit = TransportMessage::new(
                [(MESSAGE_ID, "audit-1")].into_iter().collect(),
                Vec::new(),
            );
            side.send("audit", audit, ctx.transaction())?;
            outcome()
        });
        registry
    }

    #[test]
    fn failed_attempt_discards_handler_sends() {
        let network = InMemoryNetwork::new();
        let registry = auditing(&network, || Err(anyhow!("failed after sending")));
        let h = Harness::on(network, RetryStrategySettings::new("error", 1), registry);
        h.network.deliver("orders", order("m-1")).unwrap();

        assert_eq!(h.receive_once(), Disposition::DeadLettered);
        assert_eq!(h.network.count("audit"), 0);
        assert_eq!(h.network.count("error"), 1);
    }

    #[test]
    fn successful_attempt_sends_on_commit() {
        let network = InMemoryNetwork::new();
        let registry = auditing(&network, || Ok(()));
        let h = Harness::on(network, RetryStrategySettings::new("error", 3), registry);
        h.network.deliver("orders", order("m-1")).unwrap();

        assert_eq!(h.receive_once(), Disposition::Handled);
        assert_eq!(h.network.count("audit"), 1);
    }

    #[test]
    fn cancelled_attempt_is_redelivered_without_counting() {
        let mut registry = HandlerRegistry::new();
        counting(&mut registry, || Ok(()));
        let h = Harness::new(RetryStrategySettings::new("error", 1), registry);
        h.network.deliver("orders", order("m-1")).unwrap();

        let tx = Arc::new(TransactionContext::new());
        let cancel = CancellationToken::new();
        let message = h.transport.receive(&tx, &cancel).unwrap().unwrap();
        let mut ctx = IncomingStepContext::new(message, tx.clone(), cancel.clone());
        cancel.cancel();

        let disposition = h.step.process(&mut ctx, h.invoker.incoming()).unwrap();
        tx.abort().unwrap();

        assert_eq!(disposition, Disposition::Redeliver);
        assert_eq!(h.tracker.failure_count("m-1").unwrap(), 0);
        assert_eq!(h.network.count("orders"), 1);
    }
}

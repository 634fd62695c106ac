//! Message handlers and the registry that resolves them.

use std::collections::HashMap;
use std::sync::Arc;

use relaybus_core::{CancellationToken, ExceptionInfo, HandlerError, TransportMessage};

use crate::transaction::TransactionContext;

/// What a handler gets to see while handling one message.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext<'a> {
    message: &'a TransportMessage,
    cancellation: &'a CancellationToken,
    transaction: &'a TransactionContext,
    failed_exceptions: &'a [ExceptionInfo],
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        message: &'a TransportMessage,
        cancellation: &'a CancellationToken,
        transaction: &'a TransactionContext,
        failed_exceptions: &'a [ExceptionInfo],
    ) -> Self {
        Self {
            message,
            cancellation,
            transaction,
            failed_exceptions,
        }
    }

    pub fn message(&self) -> &'a TransportMessage {
        self.message
    }

    /// Fires when the bus shuts down; long-running handlers should poll it.
    pub fn cancellation(&self) -> &'a CancellationToken {
        self.cancellation
    }

    pub fn transaction(&self) -> &'a TransactionContext {
        self.transaction
    }

    /// Failure history of the message; empty outside second-level retries.
    pub fn failed_exceptions(&self) -> &'a [ExceptionInfo] {
        self.failed_exceptions
    }
}

/// Handles messages of the type(s) it is registered for.
///
/// Handlers must be idempotent: a message is redelivered whenever an attempt
/// fails, including attempts where this handler itself succeeded.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, ctx: &HandlerContext<'_>) -> Result<(), HandlerError>;

    /// Whether this handler wants to see messages whose ordinary retries
    /// are exhausted (second-level retries).
    fn handles_failed(&self) -> bool {
        false
    }

    /// Last chance for an exhausted message. Only called when `handles_failed`
    /// returns true and second-level retries are enabled.
    fn handle_failed(&self, ctx: &HandlerContext<'_>) -> Result<(), HandlerError> {
        let _ = ctx;
        Ok(())
    }
}

/// Adapter turning a closure into a `MessageHandler`.
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&HandlerContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&HandlerContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &HandlerContext<'_>) -> Result<(), HandlerError> {
        (self.handler)(ctx)
    }
}

/// Maps message types (`msg-type` header) to handlers.
///
/// Patterns:
/// - exact type, e.g. `order.placed`
/// - category, e.g. `order.*` matches every `order.` type
/// - `*` matches everything, including messages without a type
///
/// All matching handlers run, exact matches first, then categories, then `*`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(pattern.into()).or_default().push(handler);
    }

    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&HandlerContext<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(pattern, Arc::new(FnHandler::new(handler)));
    }

    /// Handlers for a message type, in invocation order.
    pub fn handlers_for(&self, message_type: Option<&str>) -> Vec<Arc<dyn MessageHandler>> {
        let mut resolved = Vec::new();

        if let Some(type_name) = message_type {
            if let Some(exact) = self.handlers.get(type_name) {
                resolved.extend(exact.iter().cloned());
            }

            let mut categories: Vec<_> = self
                .handlers
                .iter()
                .filter(|(pattern, _)| {
                    pattern
                        .strip_suffix(".*")
                        .is_some_and(|prefix| type_name.starts_with(&format!("{prefix}.")))
                })
                .collect();
            // HashMap order is arbitrary; keep category resolution deterministic.
            categories.sort_by(|a, b| a.0.cmp(b.0));
            for (_, handlers) in categories {
                resolved.extend(handlers.iter().cloned());
            }
        }

        if let Some(wildcard) = self.handlers.get("*") {
            resolved.extend(wildcard.iter().cloned());
        }

        resolved
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

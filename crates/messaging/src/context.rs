//! Per-receive / per-send data passed between pipeline steps.
//!
//! Well-known values are plain fields. Anything else a custom step wants to
//! hand to a later step goes into `Extensions`, keyed by type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use relaybus_core::{CancellationToken, ExceptionInfo, TransportMessage};

use crate::handler::MessageHandler;
use crate::transaction::TransactionContext;

/// Type-keyed bag for ad hoc values, at most one value per type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl core::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// Context of one received message, created fresh per receive.
pub struct IncomingStepContext {
    message: TransportMessage,
    transaction: Arc<TransactionContext>,
    cancellation: CancellationToken,
    handlers: Vec<Arc<dyn MessageHandler>>,
    failed_exceptions: Vec<ExceptionInfo>,
    second_level_retry: bool,
    extensions: Extensions,
}

impl IncomingStepContext {
    pub fn new(
        message: TransportMessage,
        transaction: Arc<TransactionContext>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            message,
            transaction,
            cancellation,
            handlers: Vec::new(),
            failed_exceptions: Vec::new(),
            second_level_retry: false,
            extensions: Extensions::new(),
        }
    }

    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    /// Swap in a different message, returning the previous one.
    pub fn replace_message(&mut self, message: TransportMessage) -> TransportMessage {
        std::mem::replace(&mut self.message, message)
    }

    pub fn transaction(&self) -> &TransactionContext {
        &self.transaction
    }

    /// Swap in a different transaction for the remaining steps, returning the
    /// previous one. Used to scope handler side effects to a single attempt.
    pub fn replace_transaction(
        &mut self,
        transaction: Arc<TransactionContext>,
    ) -> Arc<TransactionContext> {
        std::mem::replace(&mut self.transaction, transaction)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Handlers resolved for the current message (filled by handler activation).
    pub fn handlers(&self) -> &[Arc<dyn MessageHandler>] {
        &self.handlers
    }

    pub fn set_handlers(&mut self, handlers: Vec<Arc<dyn MessageHandler>>) {
        self.handlers = handlers;
    }

    /// Failure history, only populated during a second-level retry dispatch.
    pub fn failed_exceptions(&self) -> &[ExceptionInfo] {
        &self.failed_exceptions
    }

    pub fn set_failed_exceptions(&mut self, exceptions: Vec<ExceptionInfo>) {
        self.failed_exceptions = exceptions;
    }

    /// True only while the retry step runs a second-level dispatch. Headers
    /// on the received message never turn this on.
    pub fn is_second_level_retry(&self) -> bool {
        self.second_level_retry
    }

    pub fn set_second_level_retry(&mut self, enabled: bool) {
        self.second_level_retry = enabled;
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl core::fmt::Debug for IncomingStepContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IncomingStepContext")
            .field("message_id", &self.message.message_id())
            .field("handlers", &self.handlers.len())
            .field("failed_exceptions", &self.failed_exceptions.len())
            .field("second_level_retry", &self.second_level_retry)
            .finish()
    }
}

/// Context of one outgoing message.
#[derive(Debug)]
pub struct OutgoingStepContext {
    message: TransportMessage,
    destinations: Vec<String>,
    transaction: Arc<TransactionContext>,
    extensions: Extensions,
}

impl OutgoingStepContext {
    pub fn new(
        message: TransportMessage,
        destinations: Vec<String>,
        transaction: Arc<TransactionContext>,
    ) -> Self {
        Self {
            message,
            destinations,
            transaction,
            extensions: Extensions::new(),
        }
    }

    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    pub fn replace_message(&mut self, message: TransportMessage) -> TransportMessage {
        std::mem::replace(&mut self.message, message)
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    pub fn transaction(&self) -> &TransactionContext {
        &self.transaction
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TenantTag(&'static str);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(TenantTag("a")).is_none());
        assert_eq!(ext.insert(TenantTag("b")), Some(TenantTag("a")));
        ext.insert(42u32);

        assert_eq!(ext.get::<TenantTag>(), Some(&TenantTag("b")));
        assert_eq!(ext.get::<u32>(), Some(&42));
        assert_eq!(ext.len(), 2);

        *ext.get_mut::<u32>().unwrap() += 1;
        assert_eq!(ext.remove::<u32>(), Some(43));
        assert!(ext.get::<u32>().is_none());
    }

    #[test]
    fn replace_message_returns_previous() {
        let original = TransportMessage::new(
            [(relaybus_core::headers::MESSAGE_ID, "m-1")].into_iter().collect(),
            Vec::new(),
        );
        let mut ctx = IncomingStepContext::new(
            original.clone(),
            Arc::new(TransactionContext::new()),
            CancellationToken::new(),
        );

        let marked = original.with_header("x", "y");
        let previous = ctx.replace_message(marked.clone());

        assert_eq!(previous, original);
        assert_eq!(ctx.message(), &marked);
    }
}

//! Factories turning handler errors into `ExceptionInfo` records.

use std::sync::Arc;

use relaybus_core::{Clock, ExceptionInfo, HandlerError};

/// Captures a failure at the factory clock's current time.
pub trait ExceptionInfoFactory: Send + Sync {
    fn create_info(&self, error: HandlerError) -> ExceptionInfo;
}

/// Keeps only the textual rendering; safe for durable error tracking.
pub struct TextExceptionInfoFactory {
    clock: Arc<dyn Clock>,
}

impl TextExceptionInfoFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl ExceptionInfoFactory for TextExceptionInfoFactory {
    fn create_info(&self, error: HandlerError) -> ExceptionInfo {
        ExceptionInfo::from_error(&error, self.clock.now())
    }
}

/// Also retains the live error. Only for in-process tracking (e.g. tests
/// asserting on the concrete error a handler raised).
pub struct InMemExceptionInfoFactory {
    clock: Arc<dyn Clock>,
}

impl InMemExceptionInfoFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl ExceptionInfoFactory for InMemExceptionInfoFactory {
    fn create_info(&self, error: HandlerError) -> ExceptionInfo {
        ExceptionInfo::with_live_error(Arc::new(error), self.clock.now())
    }
}

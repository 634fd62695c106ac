//! Decides which failures skip retrying entirely.

use std::sync::Arc;

use relaybus_core::{BusError, FailFastError, HandlerError};

/// Classifies failures that retrying cannot fix.
pub trait FailFastChecker: Send + Sync {
    fn should_fail_fast(&self, message_id: &str, error: &HandlerError) -> bool;
}

type Predicate = dyn Fn(&HandlerError) -> bool + Send + Sync;

/// Fails fast on `FailFastError` and on messages nobody handles, anywhere in
/// the cause chain. Extra conditions can be added with `with_predicate`.
#[derive(Default, Clone)]
pub struct DefaultFailFastChecker {
    predicates: Vec<Arc<Predicate>>,
}

impl DefaultFailFastChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }
}

impl FailFastChecker for DefaultFailFastChecker {
    fn should_fail_fast(&self, _message_id: &str, error: &HandlerError) -> bool {
        let built_in = error.chain().any(|cause| {
            cause.is::<FailFastError>()
                || matches!(cause.downcast_ref::<BusError>(), Some(BusError::NoHandlers(_)))
        });
        built_in || self.predicates.iter().any(|predicate| predicate(error))
    }
}

impl core::fmt::Debug for DefaultFailFastChecker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DefaultFailFastChecker")
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn ordinary_errors_are_retried() {
        let checker = DefaultFailFastChecker::new();
        assert!(!checker.should_fail_fast("m-1", &anyhow!("timeout talking to db")));
        assert!(!checker.should_fail_fast("m-1", &BusError::transport("down").into()));
    }

    #[test]
    fn fail_fast_error_is_found_through_context() {
        let checker = DefaultFailFastChecker::new();
        let error = Err::<(), _>(FailFastError::new("schema mismatch"))
            .context("decoding order")
            .unwrap_err();

        assert!(checker.should_fail_fast("m-1", &error));
    }

    #[test]
    fn unhandled_messages_fail_fast() {
        let checker = DefaultFailFastChecker::new();
        let error = BusError::NoHandlers("order.placed".into()).into();
        assert!(checker.should_fail_fast("m-1", &error));
    }

    #[test]
    fn custom_predicates_extend_the_defaults() {
        let checker = DefaultFailFastChecker::new()
            .with_predicate(|error| error.to_string().contains("permission denied"));

        assert!(checker.should_fail_fast("m-1", &anyhow!("permission denied for tenant")));
        assert!(!checker.should_fail_fast("m-1", &anyhow!("deadlock detected")));
    }
}

//! Bus error model.

use thiserror::Error;

/// Result type used by bus infrastructure (transport, tracker, gate, pipeline wiring).
pub type BusResult<T> = Result<T, BusError>;

/// Failure raised by handler code or by a pipeline step.
///
/// Handlers may return any error; the retry machinery only needs to render it
/// and, for fail-fast decisions, inspect its cause chain.
pub type HandlerError = anyhow::Error;

/// Infrastructure-level error.
///
/// These are failures of the bus itself, not of user handlers. When one of them
/// surfaces inside a receive attempt, that attempt is aborted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The transport failed to send, receive or create a queue.
    #[error("transport error: {0}")]
    Transport(String),

    /// A queue address was not known to the transport.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Internal state was left poisoned by a panicking thread.
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),

    /// Anchor-based injection referenced a step that is not registered.
    #[error("pipeline step not found: {0}")]
    StepNotFound(String),

    /// A step with the same name is already registered.
    #[error("duplicate pipeline step: {0}")]
    DuplicateStep(String),

    /// No handler accepted the message.
    #[error("no handlers for message type '{0}'")]
    NoHandlers(String),

    /// Configuration values are invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation observed a shutdown request and stopped early.
    #[error("operation cancelled")]
    Cancelled,
}

impl BusError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Short, stable name of the variant (used when recording failures).
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::Transport(_) => "Transport",
            BusError::UnknownQueue(_) => "UnknownQueue",
            BusError::Poisoned(_) => "Poisoned",
            BusError::StepNotFound(_) => "StepNotFound",
            BusError::DuplicateStep(_) => "DuplicateStep",
            BusError::NoHandlers(_) => "NoHandlers",
            BusError::Config(_) => "Config",
            BusError::Cancelled => "Cancelled",
        }
    }
}

/// Marker error requesting immediate dead-lettering.
///
/// Return it from a handler (directly or anywhere in an `anyhow` context chain)
/// when retrying cannot possibly help, e.g. the message is malformed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct FailFastError(String);

impl FailFastError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(BusError::transport("down").kind(), "Transport");
        assert_eq!(BusError::NoHandlers("x".into()).kind(), "NoHandlers");
    }

    #[test]
    fn fail_fast_survives_context_wrapping() {
        let err: HandlerError = anyhow::Error::new(FailFastError::new("bad payload"))
            .context("while handling order");

        let found = err.chain().any(|cause| cause.is::<FailFastError>());
        assert!(found);
        assert_eq!(err.to_string(), "while handling order");
    }
}

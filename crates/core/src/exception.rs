//! Storable record of a captured failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BusError, FailFastError, HandlerError};

/// Immutable description of one failure.
///
/// The text fields are all a durable store needs. `live` optionally keeps the
/// original error object; it is never serialized and only meaningful while the
/// record stays in the process that captured it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionInfo {
    type_name: String,
    message: String,
    details: String,
    time: DateTime<Utc>,
    #[serde(skip)]
    live: Option<Arc<HandlerError>>,
}

impl ExceptionInfo {
    /// Text-only capture of `error` at `time`.
    pub fn from_error(error: &HandlerError, time: DateTime<Utc>) -> Self {
        Self {
            type_name: type_name_of(error).to_string(),
            message: error.to_string(),
            details: format!("{error:?}"),
            time,
            live: None,
        }
    }

    /// Capture that also retains the live error object.
    pub fn with_live_error(error: Arc<HandlerError>, time: DateTime<Utc>) -> Self {
        let mut info = Self::from_error(&error, time);
        info.live = Some(error);
        info
    }

    /// Record for a condition that has no error object of its own.
    pub fn synthetic(
        type_name: impl Into<String>,
        message: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        let type_name = type_name.into();
        let message = message.into();
        Self {
            details: format!("{type_name}: {message}"),
            type_name,
            message,
            time,
            live: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Full textual detail, including the cause chain.
    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn live_error(&self) -> Option<&HandlerError> {
        self.live.as_deref()
    }

    /// One-line-per-field rendering used for the `error-details` header.
    pub fn full_description(&self) -> String {
        format!(
            "{} ({}): {}\n{}",
            self.type_name,
            self.time.to_rfc3339(),
            self.message,
            self.details
        )
    }
}

impl PartialEq for ExceptionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name
            && self.message == other.message
            && self.details == other.details
            && self.time == other.time
    }
}

/// Best-effort type name of a handler error.
///
/// `anyhow` erases concrete types, so only the error types this workspace knows
/// about can be named; anything else reports as `anyhow::Error`.
pub fn type_name_of(error: &HandlerError) -> &'static str {
    for cause in error.chain() {
        if cause.is::<FailFastError>() {
            return "FailFastError";
        }
        if let Some(bus) = cause.downcast_ref::<BusError>() {
            return match bus {
                BusError::NoHandlers(_) => "BusError::NoHandlers",
                BusError::Transport(_) => "BusError::Transport",
                BusError::UnknownQueue(_) => "BusError::UnknownQueue",
                BusError::Poisoned(_) => "BusError::Poisoned",
                BusError::StepNotFound(_) => "BusError::StepNotFound",
                BusError::DuplicateStep(_) => "BusError::DuplicateStep",
                BusError::Config(_) => "BusError::Config",
                BusError::Cancelled => "BusError::Cancelled",
            };
        }
    }
    "anyhow::Error"
}

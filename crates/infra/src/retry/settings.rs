//! Retry strategy settings.

use std::time::Duration;

/// Immutable retry configuration shared by the tracker and the retry step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategySettings {
    max_delivery_attempts: u32,
    error_queue: String,
    second_level_retries: bool,
    error_record_max_age: Duration,
}

impl Default for RetryStrategySettings {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            error_queue: "error".to_string(),
            second_level_retries: false,
            error_record_max_age: Duration::from_secs(10 * 60),
        }
    }
}

impl RetryStrategySettings {
    pub fn new(error_queue: impl Into<String>, max_delivery_attempts: u32) -> Self {
        Self {
            max_delivery_attempts,
            error_queue: error_queue.into(),
            ..Default::default()
        }
    }

    pub fn with_second_level_retries(mut self, enabled: bool) -> Self {
        self.second_level_retries = enabled;
        self
    }

    pub fn with_error_record_max_age(mut self, max_age: Duration) -> Self {
        self.error_record_max_age = max_age;
        self
    }

    /// Failures after which a message counts as exhausted.
    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    pub fn second_level_retries(&self) -> bool {
        self.second_level_retries
    }

    pub fn error_record_max_age(&self) -> Duration {
        self.error_record_max_age
    }
}

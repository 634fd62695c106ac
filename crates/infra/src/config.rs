//! Bus configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use relaybus_core::{BusError, BusResult};

use crate::retry::RetryStrategySettings;
use crate::workers::{default_backoff_times, validate_backoff_times};

/// Plain configuration values for one bus instance.
///
/// Durations are (de)serialized as milliseconds (`*_ms` keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Queue the workers receive from.
    pub input_queue: String,
    /// Where dead-lettered messages go.
    pub error_queue: String,
    /// Tracked failures after which a message is exhausted.
    pub max_delivery_attempts: u32,
    pub second_level_retries: bool,
    #[serde(rename = "error_record_max_age_ms", with = "duration_ms")]
    pub error_record_max_age: Duration,
    /// Worker threads polling the input queue.
    pub workers: usize,
    /// Receive operations allowed in flight across all workers.
    pub max_parallelism: usize,
    /// Idle wait table, indexed by idle seconds.
    #[serde(rename = "backoff_times_ms", with = "duration_ms_list")]
    pub backoff_times: Vec<Duration>,
    #[serde(rename = "error_wait_ms", with = "duration_ms")]
    pub error_wait: Duration,
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// How often expired error records are pruned in the background.
    #[serde(rename = "prune_interval_ms", with = "duration_ms")]
    pub prune_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            input_queue: String::new(),
            error_queue: "error".to_string(),
            max_delivery_attempts: 5,
            second_level_retries: false,
            error_record_max_age: Duration::from_secs(10 * 60),
            workers: 1,
            max_parallelism: 5,
            backoff_times: default_backoff_times(),
            error_wait: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl BusConfig {
    pub fn new(input_queue: impl Into<String>) -> Self {
        Self {
            input_queue: input_queue.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json_str(json: &str) -> BusResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BusError::config(format!("malformed bus config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_error_queue(mut self, error_queue: impl Into<String>) -> Self {
        self.error_queue = error_queue.into();
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_second_level_retries(mut self, enabled: bool) -> Self {
        self.second_level_retries = enabled;
        self
    }

    pub fn with_error_record_max_age(mut self, max_age: Duration) -> Self {
        self.error_record_max_age = max_age;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    pub fn with_backoff_times(mut self, times: Vec<Duration>) -> Self {
        self.backoff_times = times;
        self
    }

    pub fn with_error_wait(mut self, wait: Duration) -> Self {
        self.error_wait = wait;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.input_queue.trim().is_empty() {
            return Err(BusError::config("input_queue must not be empty"));
        }
        if self.error_queue.trim().is_empty() {
            return Err(BusError::config("error_queue must not be empty"));
        }
        if self.input_queue == self.error_queue {
            return Err(BusError::config("input_queue and error_queue must differ"));
        }
        if self.max_delivery_attempts == 0 {
            return Err(BusError::config("max_delivery_attempts must be at least 1"));
        }
        if self.workers == 0 {
            return Err(BusError::config("workers must be at least 1"));
        }
        if self.max_parallelism == 0 {
            return Err(BusError::config("max_parallelism must be at least 1"));
        }
        if self.prune_interval.is_zero() {
            return Err(BusError::config("prune_interval must be positive"));
        }
        validate_backoff_times(&self.backoff_times)
    }

    pub fn retry_settings(&self) -> RetryStrategySettings {
        RetryStrategySettings::new(self.error_queue.clone(), self.max_delivery_attempts)
            .with_second_level_retries(self.second_level_retries)
            .with_error_record_max_age(self.error_record_max_age)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod duration_ms_list {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        Vec::<u64>::deserialize(deserializer)
            .map(|millis| millis.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_input_queue_is_set() {
        assert!(BusConfig::default().validate().is_err());

        let config = BusConfig::new("orders");
        config.validate().unwrap();
        assert_eq!(config.error_queue, "error");
        assert_eq!(config.max_delivery_attempts, 5);
        assert!(!config.second_level_retries);
    }

    #[test]
    fn parses_json_with_millisecond_durations() {
        let config = BusConfig::from_json_str(
            r#"{
                "input_queue": "orders",
                "max_delivery_attempts": 3,
                "second_level_retries": true,
                "workers": 4,
                "max_parallelism": 2,
                "backoff_times_ms": [10, 20, 20, 50],
                "error_wait_ms": 1500
            }"#,
        )
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.error_wait, Duration::from_millis(1500));
        assert_eq!(config.backoff_times.last(), Some(&Duration::from_millis(50)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));

        let settings = config.retry_settings();
        assert_eq!(settings.max_delivery_attempts(), 3);
        assert!(settings.second_level_retries());
    }

    #[test]
    fn serializes_back_to_the_same_shape() {
        let config = BusConfig::new("orders").with_error_wait(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["error_wait_ms"], 250);
        let back: BusConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            BusConfig::new("orders").with_max_delivery_attempts(0),
            BusConfig::new("orders").with_workers(0),
            BusConfig::new("orders").with_max_parallelism(0),
            BusConfig::new("orders").with_error_queue(""),
            BusConfig::new("orders").with_error_queue("orders"),
            BusConfig::new("orders").with_backoff_times(Vec::new()),
            BusConfig::new("orders")
                .with_backoff_times(vec![Duration::from_secs(1), Duration::from_millis(1)]),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(BusError::Config(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            BusConfig::from_json_str("{ not json"),
            Err(BusError::Config(_))
        ));
    }
}

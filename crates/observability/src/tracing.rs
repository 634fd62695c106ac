//! Tracing/logging initialization.
//!
//! Bus components only emit `tracing` events (`worker`, `message_id`,
//! `queue` fields); the host decides here where they go.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Subscriber settings. `RUST_LOG` overrides `default_filter` when set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub default_filter: String,
    pub format: LogFormat,
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
            with_target: false,
        }
    }
}

impl TracingConfig {
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber. Safe to call multiple times (subsequent
/// calls are no-ops).
pub fn init(config: &TracingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(config.with_target);

    let _ = match config.format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

/// Human-readable output captured by the test harness, `debug` by default.
pub fn init_for_tests() {
    let config = TracingConfig::default().with_default_filter("debug");
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes_with_defaults() {
        let config: TracingConfig = serde_json::from_str(
            r#"{ "format": "pretty", "default_filter": "relaybus_infra=debug" }"#,
        )
        .unwrap();

        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.default_filter, "relaybus_infra=debug");
        assert!(!config.with_target);
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_for_tests();
        init(&TracingConfig::default());
        init(&TracingConfig::default().with_format(LogFormat::Pretty));
    }
}

//! Process-wide tracing setup for bus hosts and tests.

/// Initialize JSON tracing with the `info` default filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&TracingConfig::default());
}

/// Tracing configuration and subscriber installation.
pub mod tracing;

pub use self::tracing::{LogFormat, TracingConfig, init_for_tests};

//! Failure handling for received messages: failure capture, per-message
//! error tracking, fail-fast policy and the retry step itself.

mod error_tracker;
mod exception_info;
mod fail_fast;
mod settings;
mod step;

pub use error_tracker::{ErrorRecord, ErrorTracker, InMemoryErrorTracker};
pub use exception_info::{ExceptionInfoFactory, InMemExceptionInfoFactory, TextExceptionInfoFactory};
pub use fail_fast::{DefaultFailFastChecker, FailFastChecker};
pub use settings::RetryStrategySettings;
pub use step::{Disposition, RetryStep};

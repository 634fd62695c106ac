//! Bus runtime: retry handling, concurrency gate, backoff, workers and the
//! bus host that wires them to a transport.

pub mod bus;
pub mod config;
pub mod retry;
pub mod workers;

pub use bus::{Bus, BusBuilder};
pub use config::BusConfig;
pub use retry::{
    DefaultFailFastChecker, Disposition, ErrorTracker, ExceptionInfoFactory, FailFastChecker,
    InMemExceptionInfoFactory, InMemoryErrorTracker, RetryStep, RetryStrategySettings,
    TextExceptionInfoFactory,
};
pub use workers::{
    BackoffStrategy, DefaultBackoffStrategy, OperationToken, ParallelOperationsManager, Worker,
    WorkerHandle, WorkerStats,
};

//! Background receive workers and the resources they share.

mod backoff;
mod parallel;
mod worker;

pub use backoff::{
    BackoffStrategy, DefaultBackoffStrategy, default_backoff_times, validate_backoff_times,
};
pub use parallel::{OperationToken, ParallelOperationsManager};
pub use worker::{Worker, WorkerHandle, WorkerShared, WorkerStats};

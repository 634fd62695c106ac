//! `relaybus-core`: message model and shared building blocks.
//!
//! This crate contains no transport, pipeline or worker logic.

pub mod cancel;
pub mod clock;
pub mod error;
pub mod exception;
pub mod headers;
pub mod message;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BusError, BusResult, FailFastError, HandlerError};
pub use exception::ExceptionInfo;
pub use headers::Headers;
pub use message::{MessageId, TransportMessage};

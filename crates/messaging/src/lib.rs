//! `relaybus-messaging`: pipeline, transport contract and handler dispatch.
//!
//! This crate is mechanics only: it knows how to move a message through a
//! chain of steps and into handlers, but it makes no retry decisions.

pub mod context;
pub mod handler;
pub mod in_memory_transport;
pub mod pipeline;
pub mod step;
pub mod steps;
pub mod transaction;
pub mod transport;

pub use context::{Extensions, IncomingStepContext, OutgoingStepContext};
pub use handler::{FnHandler, HandlerContext, HandlerRegistry, MessageHandler};
pub use in_memory_transport::{InMemoryNetwork, InMemoryTransport};
pub use pipeline::{Pipeline, PipelineInvoker, Position, StepRegistry};
pub use step::{IncomingNext, IncomingStep, NamedStep, OutgoingNext, OutgoingStep, StepName};
pub use steps::{
    ActivateHandlersStep, AssignDefaultHeadersStep, DispatchIncomingMessageStep,
    SendOutgoingMessageStep, default_pipeline,
};
pub use transaction::{TransactionContext, TransactionOutcome};
pub use transport::Transport;

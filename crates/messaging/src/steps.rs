//! Built-in pipeline steps and the default pipeline.

use std::sync::Arc;

use tracing::debug;

use relaybus_core::headers::{CORRELATION_ID, MESSAGE_ID, SENT_TIME};
use relaybus_core::{BusError, BusResult, Clock, HandlerError, MessageId};

use crate::context::{IncomingStepContext, OutgoingStepContext};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::pipeline::Pipeline;
use crate::step::{IncomingNext, IncomingStep, OutgoingNext, OutgoingStep, StepName};
use crate::transport::Transport;

/// Resolves the handlers for the message type into the context.
pub struct ActivateHandlersStep {
    registry: Arc<HandlerRegistry>,
}

impl ActivateHandlersStep {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

impl IncomingStep for ActivateHandlersStep {
    fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: IncomingNext<'_>,
    ) -> Result<(), HandlerError> {
        let handlers = self.registry.handlers_for(ctx.message().message_type());
        ctx.set_handlers(handlers);
        next.run(ctx)
    }
}

/// Invokes the activated handlers.
///
/// For an ordinary dispatch every handler runs. For a second-level retry
/// dispatch (flagged on the step context by the retry step) only handlers
/// that opted in run, via `handle_failed`. No eligible handler is an error.
#[derive(Debug, Default)]
pub struct DispatchIncomingMessageStep;

impl IncomingStep for DispatchIncomingMessageStep {
    fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: IncomingNext<'_>,
    ) -> Result<(), HandlerError> {
        let second_level = ctx.is_second_level_retry();
        let message_type = ctx.message().message_type().unwrap_or("<untyped>").to_string();

        let handlers: Vec<_> = ctx
            .handlers()
            .iter()
            .filter(|h| !second_level || h.handles_failed())
            .cloned()
            .collect();

        if handlers.is_empty() {
            let what = if second_level {
                format!("{message_type} (second-level retry)")
            } else {
                message_type
            };
            return Err(BusError::NoHandlers(what).into());
        }

        {
            let hctx = HandlerContext::new(
                ctx.message(),
                ctx.cancellation(),
                ctx.transaction(),
                ctx.failed_exceptions(),
            );

            for handler in &handlers {
                if hctx.cancellation().is_cancelled() {
                    return Err(BusError::Cancelled.into());
                }
                if second_level {
                    handler.handle_failed(&hctx)?;
                } else {
                    handler.handle(&hctx)?;
                }
            }
        }

        debug!(
            message_id = ctx.message().message_id().unwrap_or_default(),
            handlers = handlers.len(),
            second_level,
            "message dispatched"
        );

        next.run(ctx)
    }
}

/// Fills in `msg-id`, `correlation-id` and `sent-time` when missing.
pub struct AssignDefaultHeadersStep {
    clock: Arc<dyn Clock>,
}

impl AssignDefaultHeadersStep {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl OutgoingStep for AssignDefaultHeadersStep {
    fn process(
        &self,
        ctx: &mut OutgoingStepContext,
        next: OutgoingNext<'_>,
    ) -> Result<(), HandlerError> {
        let mut message = ctx.message().clone();

        let id = match message.message_id() {
            Some(id) => id.to_string(),
            None => {
                let id = MessageId::new().to_string();
                message = message.with_header(MESSAGE_ID, id.clone());
                id
            }
        };
        if message.correlation_id().is_none() {
            message = message.with_header(CORRELATION_ID, id);
        }
        if message.header(SENT_TIME).is_none() {
            message = message.with_header(SENT_TIME, self.clock.now().to_rfc3339());
        }

        ctx.replace_message(message);
        next.run(ctx)
    }
}

/// Hands the message to the transport for every destination.
pub struct SendOutgoingMessageStep {
    transport: Arc<dyn Transport>,
}

impl SendOutgoingMessageStep {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl OutgoingStep for SendOutgoingMessageStep {
    fn process(
        &self,
        ctx: &mut OutgoingStepContext,
        next: OutgoingNext<'_>,
    ) -> Result<(), HandlerError> {
        for destination in ctx.destinations() {
            self.transport
                .send(destination, ctx.message().clone(), ctx.transaction())?;
        }
        next.run(ctx)
    }
}

/// Pipeline with the built-in steps in their standard order.
///
/// Custom steps can then be injected relative to them, e.g. before
/// `StepName::DispatchIncomingMessage`.
pub fn default_pipeline(
    registry: Arc<HandlerRegistry>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
) -> BusResult<Pipeline> {
    let mut pipeline = Pipeline::new();

    let incoming = pipeline.incoming_mut();
    incoming.append(
        StepName::ActivateHandlers,
        Arc::new(ActivateHandlersStep::new(registry)),
    )?;
    incoming.append(
        StepName::DispatchIncomingMessage,
        Arc::new(DispatchIncomingMessageStep),
    )?;

    let outgoing = pipeline.outgoing_mut();
    outgoing.append(
        StepName::AssignDefaultHeaders,
        Arc::new(AssignDefaultHeadersStep::new(clock)),
    )?;
    outgoing.append(
        StepName::SendOutgoingMessage,
        Arc::new(SendOutgoingMessageStep::new(transport)),
    )?;

    Ok(pipeline)
}

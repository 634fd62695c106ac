//! Pipeline step contracts (onion middleware).
//!
//! A step receives the context and a `next` continuation. It may act before
//! calling `next.run(ctx)`, after it returns, or not call it at all. Errors
//! travel back out through the enclosing steps untouched unless a step
//! chooses to handle them.

use std::borrow::Cow;
use std::sync::Arc;

use relaybus_core::HandlerError;

use crate::context::{IncomingStepContext, OutgoingStepContext};

/// Stable name of a registered step, used as the anchor for injection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepName {
    ActivateHandlers,
    DispatchIncomingMessage,
    AssignDefaultHeaders,
    SendOutgoingMessage,
    Custom(Cow<'static, str>),
}

impl StepName {
    pub fn custom(name: impl Into<Cow<'static, str>>) -> Self {
        Self::Custom(name.into())
    }
}

impl core::fmt::Display for StepName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StepName::ActivateHandlers => f.write_str("activate-handlers"),
            StepName::DispatchIncomingMessage => f.write_str("dispatch-incoming-message"),
            StepName::AssignDefaultHeaders => f.write_str("assign-default-headers"),
            StepName::SendOutgoingMessage => f.write_str("send-outgoing-message"),
            StepName::Custom(name) => f.write_str(name),
        }
    }
}

pub trait IncomingStep: Send + Sync {
    fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: IncomingNext<'_>,
    ) -> Result<(), HandlerError>;
}

pub trait OutgoingStep: Send + Sync {
    fn process(
        &self,
        ctx: &mut OutgoingStepContext,
        next: OutgoingNext<'_>,
    ) -> Result<(), HandlerError>;
}

/// A step together with the name it was registered under.
pub struct NamedStep<S: ?Sized> {
    pub(crate) name: StepName,
    pub(crate) step: Arc<S>,
}

impl<S: ?Sized> NamedStep<S> {
    pub fn name(&self) -> &StepName {
        &self.name
    }
}

impl<S: ?Sized> Clone for NamedStep<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            step: Arc::clone(&self.step),
        }
    }
}

/// Continuation over the remaining incoming steps.
///
/// It is `Copy`, so a step may run the rest of the chain more than once.
#[derive(Clone, Copy)]
pub struct IncomingNext<'a> {
    remaining: &'a [NamedStep<dyn IncomingStep>],
}

impl<'a> IncomingNext<'a> {
    pub(crate) fn new(remaining: &'a [NamedStep<dyn IncomingStep>]) -> Self {
        Self { remaining }
    }

    pub fn run(self, ctx: &mut IncomingStepContext) -> Result<(), HandlerError> {
        match self.remaining.split_first() {
            None => Ok(()),
            Some((head, rest)) => head.step.process(ctx, IncomingNext::new(rest)),
        }
    }
}

/// Continuation over the remaining outgoing steps.
#[derive(Clone, Copy)]
pub struct OutgoingNext<'a> {
    remaining: &'a [NamedStep<dyn OutgoingStep>],
}

impl<'a> OutgoingNext<'a> {
    pub(crate) fn new(remaining: &'a [NamedStep<dyn OutgoingStep>]) -> Self {
        Self { remaining }
    }

    pub fn run(self, ctx: &mut OutgoingStepContext) -> Result<(), HandlerError> {
        match self.remaining.split_first() {
            None => Ok(()),
            Some((head, rest)) => head.step.process(ctx, OutgoingNext::new(rest)),
        }
    }
}

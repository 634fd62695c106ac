//! Ordered step registries and the invoker that runs them.
//!
//! Steps are registered under a `StepName`, and new steps can be injected
//! immediately before or after an existing one. Once configured, a `Pipeline`
//! is frozen into a `PipelineInvoker`, which is shared by all workers.

use std::sync::Arc;

use relaybus_core::{BusError, BusResult, HandlerError};

use crate::context::{IncomingStepContext, OutgoingStepContext};
use crate::step::{IncomingNext, IncomingStep, NamedStep, OutgoingNext, OutgoingStep, StepName};

/// Where to put a step relative to those already registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    First,
    Last,
    Before(StepName),
    After(StepName),
}

/// Ordered list of uniquely named steps for one direction.
pub struct StepRegistry<S: ?Sized> {
    steps: Vec<NamedStep<S>>,
}

impl<S: ?Sized> StepRegistry<S> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn append(&mut self, name: StepName, step: Arc<S>) -> BusResult<()> {
        self.insert(Position::Last, name, step)
    }

    /// Insert `step` at `position`.
    ///
    /// Fails when `name` is already taken or the anchor step is absent; the
    /// registry is left unchanged in both cases.
    pub fn insert(&mut self, position: Position, name: StepName, step: Arc<S>) -> BusResult<()> {
        if self.contains(&name) {
            return Err(BusError::DuplicateStep(name.to_string()));
        }

        let index = match &position {
            Position::First => 0,
            Position::Last => self.steps.len(),
            Position::Before(anchor) => self.index_of(anchor)?,
            Position::After(anchor) => self.index_of(anchor)? + 1,
        };

        self.steps.insert(index, NamedStep { name, step });
        Ok(())
    }

    pub fn remove(&mut self, name: &StepName) -> BusResult<Arc<S>> {
        let index = self.index_of(name)?;
        Ok(self.steps.remove(index).step)
    }

    pub fn contains(&self, name: &StepName) -> bool {
        self.steps.iter().any(|s| &s.name == name)
    }

    pub fn names(&self) -> Vec<StepName> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn index_of(&self, name: &StepName) -> BusResult<usize> {
        self.steps
            .iter()
            .position(|s| &s.name == name)
            .ok_or_else(|| BusError::StepNotFound(name.to_string()))
    }
}

impl<S: ?Sized> Default for StepRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Incoming and outgoing step chains.
#[derive(Default)]
pub struct Pipeline {
    incoming: StepRegistry<dyn IncomingStep>,
    outgoing: StepRegistry<dyn OutgoingStep>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incoming(&self) -> &StepRegistry<dyn IncomingStep> {
        &self.incoming
    }

    pub fn incoming_mut(&mut self) -> &mut StepRegistry<dyn IncomingStep> {
        &mut self.incoming
    }

    pub fn outgoing(&self) -> &StepRegistry<dyn OutgoingStep> {
        &self.outgoing
    }

    pub fn outgoing_mut(&mut self) -> &mut StepRegistry<dyn OutgoingStep> {
        &mut self.outgoing
    }
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("incoming", &self.incoming.names())
            .field("outgoing", &self.outgoing.names())
            .finish()
    }
}

/// Frozen pipeline, invoked as nested continuations.
///
/// The invoker never catches: whatever a step returns is what the caller sees.
pub struct PipelineInvoker {
    incoming: Arc<[NamedStep<dyn IncomingStep>]>,
    outgoing: Arc<[NamedStep<dyn OutgoingStep>]>,
}

impl PipelineInvoker {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            incoming: pipeline.incoming.steps.into(),
            outgoing: pipeline.outgoing.steps.into(),
        }
    }

    /// Continuation over the full incoming chain.
    pub fn incoming(&self) -> IncomingNext<'_> {
        IncomingNext::new(&self.incoming)
    }

    pub fn outgoing(&self) -> OutgoingNext<'_> {
        OutgoingNext::new(&self.outgoing)
    }

    pub fn invoke_incoming(&self, ctx: &mut IncomingStepContext) -> Result<(), HandlerError> {
        self.incoming().run(ctx)
    }

    pub fn invoke_outgoing(&self, ctx: &mut OutgoingStepContext) -> Result<(), HandlerError> {
        self.outgoing().run(ctx)
    }

    pub fn incoming_names(&self) -> Vec<StepName> {
        self.incoming.iter().map(|s| s.name().clone()).collect()
    }
}

impl core::fmt::Debug for PipelineInvoker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineInvoker")
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

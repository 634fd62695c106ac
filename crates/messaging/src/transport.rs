//! Transport contract (mechanics only).
//!
//! A transport moves `TransportMessage`s between named queues. Everything
//! transport-specific (wire format, broker protocol, native redelivery) lives
//! behind this trait.
//!
//! ## Transactions
//!
//! Both directions take the receive attempt's `TransactionContext`:
//!
//! - `send` must not make the message visible before the transaction commits,
//!   so work done by a failed attempt never leaks out.
//! - `receive` must make the message available again if the transaction
//!   aborts. This is how ordinary retries happen: the retry step asks for a
//!   redelivery, the worker aborts, and the transport hands the message out again.
//!
//! ## Thread safety
//!
//! Several workers share one transport instance, so implementations must be
//! `Send + Sync` and `receive` must never hand the same delivery to two workers.

use std::sync::Arc;

use relaybus_core::{BusResult, CancellationToken, TransportMessage};

use crate::transaction::TransactionContext;

pub trait Transport: Send + Sync {
    /// Input queue this transport receives from.
    fn address(&self) -> &str;

    /// Make sure a queue exists. Idempotent.
    fn create_queue(&self, address: &str) -> BusResult<()>;

    /// Send `message` to `destination` when `tx` commits.
    fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        tx: &TransactionContext,
    ) -> BusResult<()>;

    /// Try to take the next message from the input queue without blocking
    /// for long. `Ok(None)` means the queue is currently empty.
    fn receive(
        &self,
        tx: &TransactionContext,
        cancel: &CancellationToken,
    ) -> BusResult<Option<TransportMessage>>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn address(&self) -> &str {
        (**self).address()
    }

    fn create_queue(&self, address: &str) -> BusResult<()> {
        (**self).create_queue(address)
    }

    fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        tx: &TransactionContext,
    ) -> BusResult<()> {
        (**self).send(destination, message, tx)
    }

    fn receive(
        &self,
        tx: &TransactionContext,
        cancel: &CancellationToken,
    ) -> BusResult<Option<TransportMessage>> {
        (**self).receive(tx, cancel)
    }
}

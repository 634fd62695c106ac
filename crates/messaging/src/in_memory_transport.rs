//! In-memory transport for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use relaybus_core::headers::DELIVERY_COUNT;
use relaybus_core::{BusError, BusResult, CancellationToken, TransportMessage};

use crate::transaction::TransactionContext;
use crate::transport::Transport;

type Queues = HashMap<String, VecDeque<TransportMessage>>;

/// Set of named in-memory queues shared by any number of transports.
///
/// - No IO / no async
/// - FIFO per queue; an aborted receive puts the message back at the head
/// - Optionally maintains a native `delivery-count` header, like brokers that
///   count redeliveries themselves
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    queues: Arc<Mutex<Queues>>,
    count_deliveries: bool,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network whose transports stamp each delivery with `delivery-count`.
    pub fn with_delivery_count() -> Self {
        Self {
            queues: Arc::default(),
            count_deliveries: true,
        }
    }

    pub fn create_queue(&self, address: &str) -> BusResult<()> {
        self.lock()?.entry(address.to_string()).or_default();
        Ok(())
    }

    /// Put a message on a queue immediately (outside any transaction).
    pub fn deliver(&self, address: &str, message: TransportMessage) -> BusResult<()> {
        let mut queues = self.lock()?;
        let queue = queues
            .get_mut(address)
            .ok_or_else(|| BusError::UnknownQueue(address.to_string()))?;
        queue.push_back(message);
        Ok(())
    }

    pub fn count(&self, address: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|queues| queues.get(address).map(VecDeque::len))
            .unwrap_or(0)
    }

    /// Snapshot of a queue's contents, head first.
    pub fn peek_all(&self, address: &str) -> Vec<TransportMessage> {
        self.lock()
            .ok()
            .and_then(|queues| queues.get(address).map(|q| q.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Drain a queue, head first.
    pub fn take_all(&self, address: &str) -> Vec<TransportMessage> {
        self.lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(address).map(|q| q.drain(..).collect()))
            .unwrap_or_default()
    }

    fn pop(&self, address: &str) -> BusResult<Option<TransportMessage>> {
        let mut queues = self.lock()?;
        let queue = queues
            .get_mut(address)
            .ok_or_else(|| BusError::UnknownQueue(address.to_string()))?;
        Ok(queue.pop_front())
    }

    fn lock(&self) -> BusResult<MutexGuard<'_, Queues>> {
        self.queues
            .lock()
            .map_err(|_| BusError::Poisoned("in-memory network"))
    }
}

/// Transport bound to one input queue of an `InMemoryNetwork`.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    network: InMemoryNetwork,
    address: String,
}

impl InMemoryTransport {
    /// Create the transport and its input queue.
    pub fn new(network: InMemoryNetwork, address: impl Into<String>) -> BusResult<Self> {
        let address = address.into();
        network.create_queue(&address)?;
        Ok(Self { network, address })
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    fn enlist_send(
        &self,
        destination: &str,
        message: TransportMessage,
        tx: &TransactionContext,
    ) -> BusResult<()> {
        if !self.network.lock()?.contains_key(destination) {
            return Err(BusError::UnknownQueue(destination.to_string()));
        }

        let network = self.network.clone();
        let destination = destination.to_string();
        tx.on_committed(move || {
            if let Ok(mut queues) = network.queues.lock() {
                queues.entry(destination).or_default().push_back(message);
            }
        })
    }
}

impl Transport for InMemoryTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn create_queue(&self, address: &str) -> BusResult<()> {
        self.network.create_queue(address)
    }

    fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        tx: &TransactionContext,
    ) -> BusResult<()> {
        // A fresh send starts a fresh delivery history.
        let message = if self.network.count_deliveries {
            message.without_header(DELIVERY_COUNT)
        } else {
            message
        };
        self.enlist_send(destination, message, tx)
    }

    fn receive(
        &self,
        tx: &TransactionContext,
        cancel: &CancellationToken,
    ) -> BusResult<Option<TransportMessage>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let Some(mut message) = self.network.pop(&self.address)? else {
            return Ok(None);
        };

        if self.network.count_deliveries {
            let count = message.delivery_count().unwrap_or(0).saturating_add(1);
            message = message.with_header(DELIVERY_COUNT, count.to_string());
        }

        let network = self.network.clone();
        let address = self.address.clone();
        let returned = message.clone();
        tx.on_aborted(move || {
            if let Ok(mut queues) = network.queues.lock() {
                queues.entry(address).or_default().push_front(returned);
            }
        })?;

        Ok(Some(message))
    }
}

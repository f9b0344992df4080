//! In-process broker
//!
//! Routes messages between clients of the same process with MQTT filter
//! semantics and last-will delivery. Used by the integration tests and for
//! running a manager and several stations without an external broker.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::topics::topic_matches;
use crate::transport::{BusClient, BusEvent, BusEvents, Will};

struct ClientEntry {
    name: String,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<BusEvent>,
    will: Option<Will>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, ClientEntry>,
    next_id: u64,
}

impl BrokerState {
    fn route(&self, topic: &str, payload: &[u8]) {
        for client in self.clients.values() {
            if !client.filters.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }
            let event = BusEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if client.tx.send(event).is_err() {
                debug!("Broker: {} has no receiver for {}", client.name, topic);
            }
        }
    }
}

/// Shared in-memory broker; clone to share
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new client. Its first event is [`BusEvent::Connected`].
    pub fn connect(
        &self,
        name: impl Into<String>,
        will: Option<Will>,
    ) -> (MemoryClient, BusEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(BusEvent::Connected);

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.clients.insert(
            id,
            ClientEntry {
                name: name.into(),
                filters: Vec::new(),
                tx,
                will,
            },
        );

        (
            MemoryClient {
                state: self.state.clone(),
                id,
            },
            rx,
        )
    }

    /// Drop a client without a clean disconnect: it sees `Disconnected`
    /// and its will is published to everyone else.
    pub fn kill(&self, client: &MemoryClient) {
        let mut state = self.state.lock();
        let Some(entry) = state.clients.remove(&client.id) else {
            return;
        };
        debug!("Broker: {} dropped", entry.name);
        let _ = entry.tx.send(BusEvent::Disconnected);
        if let Some(will) = entry.will {
            state.route(&will.topic, &will.payload);
        }
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }
}

/// Client handle of a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryClient {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl BusClient for MemoryClient {
    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let entry = state
            .clients
            .get_mut(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        if !entry.filters.iter().any(|f| f == filter) {
            entry.filters.push(filter.to_string());
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state.lock();
        if !state.clients.contains_key(&self.id) {
            return Err(TransportError::ConnectionClosed);
        }
        state.route(topic, &payload);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let entry = state
            .clients
            .remove(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        let _ = entry.tx.send(BusEvent::Disconnected);
        Ok(())
    }
}

use crate::{QueueError, SubQueue};
use concepts::{ClientId, EventId, EventOutcome, EventType};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::trace;

pub const CONNECTION_EVENT: &str = "connection";
pub const CLOSE_EVENT: &str = "close";

/// Websocket message exchanged with firehose clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Message {
    #[must_use]
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDescriptor {
    pub id: ClientId,
    pub remote_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDescriptor {
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehosePayload {
    pub client: ClientDescriptor,
    pub pool: PoolDescriptor,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FirehoseError {
    #[error("no client with id {0}")]
    NoClient(ClientId),
}

/// Connected firehose clients, addressed by workers replying to messages.
pub trait ClientPool: Send + Sync {
    fn size(&self) -> usize;

    fn send(&self, client_id: &ClientId, message: Message) -> Result<(), FirehoseError>;

    fn send_all(&self, message: Message);

    fn close(&self, client_id: &ClientId) -> Result<(), FirehoseError>;
}

#[derive(Default)]
pub struct FirehoseQueue {
    payloads: Mutex<hashbrown::HashMap<EventId, FirehosePayload>>,
}

impl FirehoseQueue {
    pub fn enqueue(&self, event_id: EventId, payload: FirehosePayload) {
        self.payloads.lock().unwrap().insert(event_id, payload);
    }

    pub fn pop(&self, event_id: &EventId) -> Result<FirehosePayload, QueueError> {
        self.payloads
            .lock()
            .unwrap()
            .remove(event_id)
            .ok_or(QueueError::NoItem(*event_id))
    }
}

impl SubQueue for FirehoseQueue {
    fn event_type(&self) -> EventType {
        EventType::Firehose
    }

    fn settle(&self, event_id: &EventId, outcome: EventOutcome) {
        if self.payloads.lock().unwrap().remove(event_id).is_some() {
            trace!(%event_id, %outcome, "Dropped unconsumed firehose message");
        }
    }
}

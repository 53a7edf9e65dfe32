use crate::{QueueError, SubQueue};
use concepts::{DatabaseOperation, EventId, EventOutcome, EventType};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub updated_fields: serde_json::Value,
    pub removed_fields: Vec<String>,
}

/// A single change-stream document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: DatabaseOperation,
    pub collection: String,
    /// Full document after the change, absent for deletions.
    pub document: Option<serde_json::Value>,
    pub document_key: serde_json::Value,
    pub update_description: Option<UpdateDescription>,
}

#[derive(Default)]
pub struct DatabaseQueue {
    changes: Mutex<hashbrown::HashMap<EventId, Change>>,
}

impl DatabaseQueue {
    pub fn enqueue(&self, event_id: EventId, change: Change) {
        self.changes.lock().unwrap().insert(event_id, change);
    }

    pub fn pop(&self, event_id: &EventId) -> Result<Change, QueueError> {
        self.changes
            .lock()
            .unwrap()
            .remove(event_id)
            .ok_or(QueueError::NoItem(*event_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubQueue for DatabaseQueue {
    fn event_type(&self) -> EventType {
        EventType::Database
    }

    fn settle(&self, event_id: &EventId, outcome: EventOutcome) {
        if self.changes.lock().unwrap().remove(event_id).is_some() {
            trace!(%event_id, %outcome, "Dropped unconsumed change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn change() -> Change {
        Change {
            kind: DatabaseOperation::Update,
            collection: "users".to_string(),
            document: Some(serde_json::json!({"_id": 1, "name": "a"})),
            document_key: serde_json::json!({"_id": 1}),
            update_description: Some(UpdateDescription {
                updated_fields: serde_json::json!({"name": "a"}),
                removed_fields: vec![],
            }),
        }
    }

    #[test]
    fn payload_can_be_popped_only_once() {
        let queue = DatabaseQueue::default();
        let event_id = EventId::generate();
        queue.enqueue(event_id, change());
        assert_eq!(change(), queue.pop(&event_id).unwrap());
        let err = queue.pop(&event_id).unwrap_err();
        assert_matches!(err, QueueError::NoItem(id) if id == event_id);
        assert_eq!(format!("no item with id {event_id}"), err.to_string());
        assert!(queue.is_empty());
    }
}

//! Event emission.
//!
//! Identities publish lifecycle events on a shared bus; the join consumer
//! loop subscribes to it for new join requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kith_types::EntityId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const JOIN_REQUEST: &str = "JoinRequest";
pub const ME_STATUS_CHANGED: &str = "MeStatusChanged";
pub const MY_NODE_ADDED: &str = "MyNodeAdded";
pub const MY_NODE_REMOVED: &str = "MyNodeRemoved";
pub const RAFT_LEADER_CHANGED: &str = "RaftLeaderChanged";
pub const ME_OPLOG_ALIVE: &str = "MeOplogAlive";

/// An event emitted by an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub entity_id: EntityId,
    /// Unix timestamp.
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: &str, entity_id: EntityId, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            entity_id,
            timestamp: kith_types::time::now_secs(),
            payload,
        }
    }

    pub fn is(&self, event_type: &str, entity_id: &EntityId) -> bool {
        self.event_type == event_type && self.entity_id == *entity_id
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("sequence", &self.sequence()).finish()
    }
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: Event) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[cfg(test)]
mod tests {
    use kith_types::Id;

    use super::*;

    #[test]
    fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Id::random();
        bus.emit(Event::new(JOIN_REQUEST, id, serde_json::json!({"join_type": "me"})));

        let event = rx.try_recv().expect("receive event");
        assert!(event.is(JOIN_REQUEST, &id));
        assert!(!event.is(JOIN_REQUEST, &Id::random()));
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(Event::new(ME_STATUS_CHANGED, Id::random(), serde_json::Value::Null));
        assert_eq!(bus.sequence(), 1);
    }
}

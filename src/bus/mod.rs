//! Event bus for inter-component communication
//!
//! Uses tokio::sync::broadcast for pub/sub. Consumers: the dashboard event
//! stream (`/events`), the MQTT mirror and the notifier.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event types that can be published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum HubEvent {
    BoardRegistered {
        board_id: String,
        user_id: String,
        room_id: String,
    },
    BoardUnregistered {
        board_id: String,
        user_id: String,
        released_appliances: usize,
    },
    ApplianceAdded {
        user_id: String,
        room_id: String,
        appliance_id: String,
    },
    ApplianceRemoved {
        user_id: String,
        room_id: String,
        appliance_id: String,
    },
    ApplianceStateChanged {
        user_id: String,
        room_id: String,
        appliance_id: String,
        state: bool,
    },
    /// Device fetched its pending command
    CommandDelivered { relay_id: String, state: u8 },
    DetectionSignal {
        user_id: String,
        room_id: Option<String>,
        state: bool,
        affected: usize,
    },
}

impl HubEvent {
    /// Owning user, for per-user filtering of the event stream
    pub fn user_id(&self) -> Option<&str> {
        match self {
            HubEvent::BoardRegistered { user_id, .. }
            | HubEvent::BoardUnregistered { user_id, .. }
            | HubEvent::ApplianceAdded { user_id, .. }
            | HubEvent::ApplianceRemoved { user_id, .. }
            | HubEvent::ApplianceStateChanged { user_id, .. }
            | HubEvent::DetectionSignal { user_id, .. } => Some(user_id),
            HubEvent::CommandDelivered { .. } => None,
        }
    }
}

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: HubEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}

//! Prime's internal event bus. Daemon events and alerts are published here;
//! downstream consumers (the brain pipeline, notification surfaces)
//! subscribe independently.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use alfred_protocol::Params;

/// Alerts are flagged high so consumers can jump the queue for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub daemon_id: String,
    /// Origin tag, e.g. `daemon:macbook`.
    pub source: String,
    pub event_type: String,
    pub payload: Params,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            debug!("event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

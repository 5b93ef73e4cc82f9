//! Broadcast channel carrying [`SessionEvent`]s to subscribers.

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::SessionEvent;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers; events with no subscriber are dropped
    pub fn publish(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers for session event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

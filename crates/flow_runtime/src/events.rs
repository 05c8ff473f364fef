use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const NODE_STATUS: &str = "node-status";
pub const FLOWS_STARTED: &str = "flows:started";
pub const FLOWS_STOPPED: &str = "flows:stopped";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub topic: String,
    pub payload: Value,
}

/// Runtime-wide event bus. Cloning shares the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Events emitted while nobody listens are dropped.
    pub fn emit(&self, topic: &str, payload: Value) {
        let _ = self.tx.send(RuntimeEvent {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

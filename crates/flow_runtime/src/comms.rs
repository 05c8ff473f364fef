use std::fmt::Debug;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, NODE_STATUS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommsMessage {
    pub topic: String,
    pub data: Value,
}

/// The realtime messaging channel editors subscribe to.
pub trait Comms: Send + Sync + Debug {
    fn start(&self);
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// Publishing while stopped is a no-op.
    fn publish(&self, topic: &str, data: Value);
    fn subscribe(&self) -> broadcast::Receiver<CommsMessage>;
}

#[derive(Debug)]
pub struct EmbeddedComms {
    events: EventBus,
    running: AtomicBool,
    tx: broadcast::Sender<CommsMessage>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddedComms {
    pub fn new(events: EventBus) -> Self {
        let (tx, _) = broadcast::channel(128);
        Self {
            events,
            running: AtomicBool::new(false),
            tx,
            forwarder: Mutex::new(None),
        }
    }

    fn forwarder(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Comms for EmbeddedComms {
    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        // status updates are relayed as `status/<node id>`
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut events = self.events.subscribe();
                let tx = self.tx.clone();
                let task = handle.spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) if event.topic == NODE_STATUS => {
                                let id = event.payload["id"].as_str().unwrap_or_default();
                                let _ = tx.send(CommsMessage {
                                    topic: format!("status/{id}"),
                                    data: event.payload["status"].clone(),
                                });
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("comms lagged behind by {n} runtime events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                *self.forwarder() = Some(task);
            }
            Err(_) => warn!("comms started outside a tokio runtime, status relay disabled"),
        }
        info!("comms started");
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.forwarder().take() {
            task.abort();
        }
        info!("comms stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, data: Value) {
        if !self.is_running() {
            debug!(%topic, "comms not running, dropping message");
            return;
        }
        let _ = self.tx.send(CommsMessage {
            topic: topic.to_string(),
            data,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<CommsMessage> {
        self.tx.subscribe()
    }
}

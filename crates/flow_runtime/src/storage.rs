use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runtime::RuntimeError;

/// Flow records plus the credentials that travel with them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub flows: Vec<Value>,
    #[serde(default)]
    pub credentials: Map<String, Value>,
}

impl FlowConfig {
    pub fn new(flows: Vec<Value>) -> Self {
        Self {
            flows,
            credentials: Map::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: Map<String, Value>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Where the registry reads flows from.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    async fn get_flows(&self) -> Result<FlowConfig, RuntimeError>;
}

/// Runtime settings as seen by the registry and by node types.
pub trait Settings: Send + Sync + Debug {
    /// Whether settings can be persisted.
    fn available(&self) -> bool;
    fn get(&self, key: &str) -> Option<Value>;
}

/// Settings of an unconfigured runtime.
#[derive(Debug, Default)]
pub struct NoSettings;

impl Settings for NoSettings {
    fn available(&self) -> bool {
        false
    }

    fn get(&self, _key: &str) -> Option<Value> {
        None
    }
}

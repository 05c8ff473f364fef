use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use flow_runtime::{
    AdminApi, Comms, ContextStore, EventBus, FlowConfig, Inert, NodeConstructor, NodeError,
    NodePrototype, NodeRegistry, RegistryConfig, RuntimeError, RuntimeLog, Settings, Storage,
    constructor,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::binder::Binding;
use crate::error::{HelperError, Result};

/// Node type every flow may use; plain generic node construction.
pub const HELPER_TYPE: &str = "helper";

/// Credential data keyed by node id.
pub type Credentials = Map<String, Value>;

/// The node records of a flow, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowDefinition(Vec<Value>);

impl FlowDefinition {
    pub fn new(records: Vec<Value>) -> Self {
        Self(records)
    }

    pub fn records(&self) -> &[Value] {
        &self.0
    }

    pub fn into_records(self) -> Vec<Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Value>> for FlowDefinition {
    fn from(records: Vec<Value>) -> Self {
        Self(records)
    }
}

/// A JSON array is taken record by record, anything else as a single record.
impl From<Value> for FlowDefinition {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(records) => Self(records),
            Value::Null => Self::default(),
            record => Self(vec![record]),
        }
    }
}

/// Storage stand-in: hands back exactly the flows and credentials it was given.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    flows: FlowConfig,
}

impl MemoryStorage {
    pub fn new(flow: &FlowDefinition, credentials: Credentials) -> Self {
        Self {
            flows: FlowConfig::new(flow.records().to_vec()).with_credentials(credentials),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_flows(&self) -> std::result::Result<FlowConfig, RuntimeError> {
        Ok(self.flows.clone())
    }
}

/// Settings stand-in: never persistable, serves the user settings.
#[derive(Debug, Clone, Default)]
pub struct HelperSettings {
    user: Map<String, Value>,
}

impl HelperSettings {
    pub fn new(user: Map<String, Value>) -> Self {
        Self { user }
    }
}

impl Settings for HelperSettings {
    fn available(&self) -> bool {
        false
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.user.get(key).cloned()
    }
}

/// What a registration callback gets to see: the live runtime sub-handles,
/// without the runtime lifecycle.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub registry: Arc<dyn NodeRegistry>,
    pub events: EventBus,
    pub log: Arc<RuntimeLog>,
    pub context: Arc<dyn ContextStore>,
    pub comms: Arc<dyn Comms>,
    pub admin: Arc<dyn AdminApi>,
    pub prototype: Arc<NodePrototype>,
    pub settings: Arc<HelperSettings>,
    version: String,
}

impl Capabilities {
    pub(crate) fn new(binding: &Binding, settings: Arc<HelperSettings>) -> Self {
        Self {
            registry: binding.registry.clone(),
            events: binding.events.clone(),
            log: binding.log.clone(),
            context: binding.context.clone(),
            comms: binding.comms.clone(),
            admin: binding.admin.clone(),
            prototype: binding.prototype.clone(),
            settings,
            version: binding.runtime.version().to_string(),
        }
    }

    pub fn register_type(
        &self,
        name: &str,
        constructor: NodeConstructor,
    ) -> std::result::Result<(), NodeError> {
        self.registry.register_type(name, constructor)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Message catalogue lookup. No catalogues are loaded, so ids come back as is.
    pub fn translate(&self, id: &str) -> String {
        id.to_string()
    }
}

pub type Registration =
    Box<dyn FnOnce(&Capabilities) -> std::result::Result<(), NodeError> + Send>;

/// Callbacks registering the node types under test, run in order.
#[derive(Default)]
pub struct Registrations(Vec<Registration>);

impl Registrations {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn and<F>(mut self, registration: F) -> Self
    where
        F: FnOnce(&Capabilities) -> std::result::Result<(), NodeError> + Send + 'static,
    {
        self.0.push(Box::new(registration));
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Registration> for Registrations {
    fn from_iter<I: IntoIterator<Item = Registration>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Debug for Registrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Registrations({})", self.0.len())
    }
}

/// A single registration callback.
pub fn register<F>(registration: F) -> Registrations
where
    F: FnOnce(&Capabilities) -> std::result::Result<(), NodeError> + Send + 'static,
{
    Registrations::none().and(registration)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowState::Unloaded => "unloaded",
            FlowState::Loading => "loading",
            FlowState::Loaded => "loaded",
            FlowState::Unloading => "unloading",
        })
    }
}

/// Everything `load` does once the log spy is attached: storage and settings
/// stand-ins, registry init, type registration, load, start and the
/// round-trip check.
pub(crate) async fn start(
    binding: &Binding,
    user_settings: Map<String, Value>,
    registrations: Registrations,
    flow: &FlowDefinition,
    credentials: Credentials,
) -> Result<()> {
    let storage = Arc::new(MemoryStorage::new(flow, credentials));
    let settings = Arc::new(HelperSettings::new(user_settings));
    let capabilities = Capabilities::new(binding, settings.clone());

    binding.registry.init(RegistryConfig {
        events: binding.events.clone(),
        settings,
        storage,
        log: binding.log.clone(),
    });
    binding
        .registry
        .register_type(HELPER_TYPE, constructor(|_| Ok(Box::new(Inert))))
        .map_err(HelperError::Registration)?;

    for (index, registration) in registrations.0.into_iter().enumerate() {
        registration(&capabilities).map_err(HelperError::Registration)?;
        debug!(index, "registration ran");
    }

    binding.registry.load_flows().await?;
    binding.registry.start_flows().await?;

    let actual = binding.registry.get_flows().flows;
    if actual != flow.records() {
        return Err(HelperError::FlowMismatch {
            expected: flow.records().to_vec(),
            actual,
        });
    }
    info!(records = flow.len(), types = ?binding.registry.registered_types(), "flow loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flow_definition_from_value() {
        let flow = FlowDefinition::from(json!([{"id": "n1"}, {"id": "n2"}]));
        assert_eq!(flow.len(), 2);
        assert_eq!(FlowDefinition::from(json!({"id": "n1"})).len(), 1);
        assert!(FlowDefinition::from(Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_returns_input_verbatim() {
        let flow = FlowDefinition::new(vec![json!({"id": "n1", "type": "helper", "extra": [1, 2]})]);
        let mut credentials = Credentials::new();
        credentials.insert("n1".into(), json!({"user": "u"}));
        let stored = MemoryStorage::new(&flow, credentials.clone())
            .get_flows()
            .await
            .unwrap();
        assert_eq!(stored.flows, flow.records());
        assert_eq!(stored.credentials, credentials);
    }

    #[test]
    fn test_helper_settings_are_unavailable() {
        let mut user = Map::new();
        user.insert("functionGlobalContext".into(), json!({"answer": 42}));
        let settings = HelperSettings::new(user);
        assert!(!settings.available());
        assert_eq!(settings.get("functionGlobalContext").unwrap()["answer"], 42);
        assert!(settings.get("missing").is_none());
    }

    #[test]
    fn test_registrations_keep_order() {
        let regs = register(|_| Ok(())).and(|_| Ok(()));
        assert_eq!(regs.len(), 2);
        assert!(Registrations::none().is_empty());
        assert_eq!(FlowState::Loading.to_string(), "loading");
    }
}

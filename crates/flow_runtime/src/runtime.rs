use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::admin::{AdminApi, EmbeddedAdmin};
use crate::comms::{Comms, EmbeddedComms};
use crate::context::{ContextStore, MemoryContext};
use crate::events::EventBus;
use crate::log::RuntimeLog;
use crate::node::{NodeError, NodePrototype};
use crate::registry::{EmbeddedRegistry, NodeRegistry, RegistryConfig};
use crate::storage::{Settings, Storage};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("node registry used before init")]
    NotInitialised,
    #[error("flows are already running")]
    AlreadyRunning,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("admin api error: {0}")]
    Admin(String),
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// A flow runtime as seen from the outside: its sub-handles plus the
/// process lifecycle.
#[async_trait]
pub trait HostRuntime: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn registry(&self) -> Arc<dyn NodeRegistry>;
    fn events(&self) -> EventBus;
    fn log(&self) -> Arc<RuntimeLog>;
    fn context(&self) -> Arc<dyn ContextStore>;
    fn comms(&self) -> Arc<dyn Comms>;
    fn admin(&self) -> Arc<dyn AdminApi>;
    fn prototype(&self) -> Arc<NodePrototype>;

    async fn init(
        &self,
        settings: Arc<dyn Settings>,
        storage: Arc<dyn Storage>,
    ) -> Result<(), RuntimeError>;
    async fn start(&self) -> Result<(), RuntimeError>;
    async fn stop(&self) -> Result<(), RuntimeError>;
}

/// In-process runtime built from the embedded implementations.
#[derive(Debug)]
pub struct EmbeddedRuntime {
    registry: Arc<EmbeddedRegistry>,
    events: EventBus,
    log: Arc<RuntimeLog>,
    context: Arc<MemoryContext>,
    comms: Arc<EmbeddedComms>,
    admin: Arc<EmbeddedAdmin>,
    prototype: Arc<NodePrototype>,
}

impl EmbeddedRuntime {
    pub const NAME: &'static str = "embedded";

    pub fn new() -> Arc<Self> {
        let events = EventBus::new();
        let log = RuntimeLog::new();
        let context = MemoryContext::new();
        let prototype = NodePrototype::standard();
        let registry = EmbeddedRegistry::new(prototype.clone(), context.clone());
        let admin = EmbeddedAdmin::new(registry.clone(), log.clone());
        let comms = Arc::new(EmbeddedComms::new(events.clone()));
        Arc::new(Self {
            registry,
            events,
            log,
            context,
            comms,
            admin,
            prototype,
        })
    }
}

#[async_trait]
impl HostRuntime for EmbeddedRuntime {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn registry(&self) -> Arc<dyn NodeRegistry> {
        self.registry.clone()
    }

    fn events(&self) -> EventBus {
        self.events.clone()
    }

    fn log(&self) -> Arc<RuntimeLog> {
        self.log.clone()
    }

    fn context(&self) -> Arc<dyn ContextStore> {
        self.context.clone()
    }

    fn comms(&self) -> Arc<dyn Comms> {
        self.comms.clone()
    }

    fn admin(&self) -> Arc<dyn AdminApi> {
        self.admin.clone()
    }

    fn prototype(&self) -> Arc<NodePrototype> {
        self.prototype.clone()
    }

    async fn init(
        &self,
        settings: Arc<dyn Settings>,
        storage: Arc<dyn Storage>,
    ) -> Result<(), RuntimeError> {
        self.registry.init(RegistryConfig {
            events: self.events.clone(),
            settings,
            storage,
            log: self.log.clone(),
        });
        Ok(())
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        self.registry.load_flows().await?;
        self.registry.start_flows().await?;
        self.comms.start();
        info!(version = VERSION, "embedded runtime started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        self.comms.stop();
        self.registry.stop_flows().await?;
        info!("embedded runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Inert, constructor};
    use crate::storage::{FlowConfig, NoSettings};
    use serde_json::json;

    #[derive(Debug)]
    struct OneNode;

    #[async_trait]
    impl Storage for OneNode {
        async fn get_flows(&self) -> Result<FlowConfig, RuntimeError> {
            Ok(FlowConfig::new(vec![json!({"id": "n1", "type": "inert"})]))
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let runtime = EmbeddedRuntime::new();
        assert_eq!(runtime.name(), "embedded");

        runtime
            .init(Arc::new(NoSettings), Arc::new(OneNode))
            .await
            .unwrap();
        runtime
            .registry()
            .register_type("inert", constructor(|_| Ok(Box::new(Inert))))
            .unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.comms().is_running());
        assert_eq!(runtime.registry().active_nodes(), vec!["n1".to_string()]);

        runtime.stop().await.unwrap();
        assert!(!runtime.comms().is_running());
        assert!(runtime.registry().active_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_sub_handles_are_shared() {
        let runtime = EmbeddedRuntime::new();
        runtime.context().set("global", "k", json!(1));
        assert_eq!(runtime.context().get("global", "k"), Some(json!(1)));
        assert!(Arc::ptr_eq(&runtime.prototype(), &runtime.prototype()));
    }
}

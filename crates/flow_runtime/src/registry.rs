use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use petgraph::algo::toposort;
use petgraph::prelude::StableDiGraph;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ContextStore;
use crate::events::{EventBus, FLOWS_STARTED, FLOWS_STOPPED};
use crate::log::RuntimeLog;
use crate::node::{Node, NodeConfig, NodeConstructor, NodeEnv, NodeError, NodePrototype};
use crate::runtime::RuntimeError;
use crate::storage::{FlowConfig, Settings, Storage};

/// Collaborators handed to the registry before any flow is loaded.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub events: EventBus,
    pub settings: Arc<dyn Settings>,
    pub storage: Arc<dyn Storage>,
    pub log: Arc<RuntimeLog>,
}

/// Node type table plus the load/start/stop lifecycle of the flows.
#[async_trait]
pub trait NodeRegistry: Send + Sync + fmt::Debug {
    fn init(&self, config: RegistryConfig);
    fn register_type(&self, name: &str, constructor: NodeConstructor) -> Result<(), NodeError>;
    fn registered_types(&self) -> Vec<String>;
    async fn load_flows(&self) -> Result<(), RuntimeError>;
    async fn start_flows(&self) -> Result<(), RuntimeError>;
    async fn stop_flows(&self) -> Result<(), RuntimeError>;
    fn get_flows(&self) -> FlowConfig;
    fn clear_registry(&self);
    fn get_node(&self, id: &str) -> Option<Node>;
    fn active_nodes(&self) -> Vec<String>;
    fn settings(&self) -> Option<Arc<dyn Settings>>;
}

pub struct EmbeddedRegistry {
    prototype: Arc<NodePrototype>,
    context: Arc<dyn ContextStore>,
    config: RwLock<Option<RegistryConfig>>,
    types: DashMap<String, NodeConstructor>,
    loaded: RwLock<FlowConfig>,
    nodes: Arc<DashMap<String, Node>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl EmbeddedRegistry {
    pub fn new(prototype: Arc<NodePrototype>, context: Arc<dyn ContextStore>) -> Arc<Self> {
        Arc::new(Self {
            prototype,
            context,
            config: RwLock::new(None),
            types: DashMap::new(),
            loaded: RwLock::new(FlowConfig::default()),
            nodes: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    fn current_config(&self) -> Result<RegistryConfig, RuntimeError> {
        let guard = self.config.read().unwrap_or_else(|p| p.into_inner());
        guard.clone().ok_or(RuntimeError::NotInitialised)
    }

    fn set_loaded(&self, flows: FlowConfig) {
        let mut guard = self.loaded.write().unwrap_or_else(|p| p.into_inner());
        *guard = flows;
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *guard)
    }

    fn push_task(&self, task: JoinHandle<()>) {
        let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(task);
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn reset_cancel_token(&self) -> CancellationToken {
        let mut guard = self.cancel.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *guard, CancellationToken::new())
    }
}

/// Orders nodes so that every node starts after the nodes it is wired to.
/// Falls back to declaration order when the wiring has cycles.
pub fn start_order(configs: &[NodeConfig]) -> Vec<usize> {
    let mut graph = StableDiGraph::<usize, ()>::new();
    let mut index_of = HashMap::new();
    for (pos, cfg) in configs.iter().enumerate() {
        index_of.insert(cfg.id.as_str(), graph.add_node(pos));
    }
    for cfg in configs {
        let from = index_of[cfg.id.as_str()];
        for target in cfg.wires.iter().flatten() {
            if let Some(&to) = index_of.get(target.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }
    match toposort(&graph, None) {
        Ok(order) => order.into_iter().rev().map(|ix| graph[ix]).collect(),
        Err(cycle) => {
            debug!(node = %configs[graph[cycle.node_id()]].id, "wiring has a cycle, using declaration order");
            (0..configs.len()).collect()
        }
    }
}

#[async_trait]
impl NodeRegistry for EmbeddedRegistry {
    fn init(&self, config: RegistryConfig) {
        let mut guard = self.config.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(config);
    }

    fn register_type(&self, name: &str, constructor: NodeConstructor) -> Result<(), NodeError> {
        if self.types.contains_key(name) {
            return Err(NodeError::DuplicateType(name.to_string()));
        }
        self.types.insert(name.to_string(), constructor);
        debug!(node_type = %name, "registered node type");
        Ok(())
    }

    fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.iter().map(|t| t.key().clone()).collect();
        types.sort();
        types
    }

    async fn load_flows(&self) -> Result<(), RuntimeError> {
        let config = self.current_config()?;
        let flows = config.storage.get_flows().await?;
        for record in &flows.flows {
            NodeConfig::parse(record)?;
        }
        info!(records = flows.flows.len(), "flows loaded");
        self.set_loaded(flows);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn start_flows(&self) -> Result<(), RuntimeError> {
        let config = self.current_config()?;
        if !self.nodes.is_empty() {
            return Err(RuntimeError::AlreadyRunning);
        }
        let flows = self.get_flows();
        let configs = flows
            .flows
            .iter()
            .map(NodeConfig::parse)
            .filter(|cfg| !matches!(cfg, Ok(cfg) if cfg.is_container()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut missing: Vec<&str> = configs
            .iter()
            .map(|cfg| cfg.node_type.as_str())
            .filter(|t| !self.types.contains_key(*t))
            .collect();
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            config.log.warn(format!(
                "Waiting for missing types to be registered: {}",
                missing.join(", ")
            ));
            return Ok(());
        }

        let known: HashSet<&str> = configs.iter().map(|cfg| cfg.id.as_str()).collect();
        for cfg in &configs {
            for target in cfg.wires.iter().flatten() {
                if !known.contains(target.as_str()) {
                    warn!(node = %cfg.id, %target, "node is wired to an unknown node");
                }
            }
        }

        let env = NodeEnv::new(
            self.prototype.clone(),
            config.log.clone(),
            config.events.clone(),
            self.context.clone(),
        )
        .with_peers(&self.nodes);
        let cancel = self.cancel_token();

        for pos in start_order(&configs) {
            let cfg = configs[pos].clone();
            let Some(constructor) = self.types.get(&cfg.node_type).map(|c| c.value().clone())
            else {
                continue;
            };
            let credentials = flows.credentials.get(&cfg.id).cloned();
            let (node, mailbox) = Node::create(cfg, credentials, env.clone());
            match constructor(&node) {
                Ok(behavior) => {
                    self.nodes.insert(node.id().to_string(), node.clone());
                    self.push_task(node.spawn(mailbox, behavior, cancel.clone()));
                }
                Err(err) => node.error(format!("failed to create node: {err}")),
            }
        }

        info!(nodes = self.nodes.len(), "flows started");
        config
            .events
            .emit(FLOWS_STARTED, json!({ "nodes": self.active_nodes() }));
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn stop_flows(&self) -> Result<(), RuntimeError> {
        self.reset_cancel_token().cancel();
        for task in self.take_tasks() {
            if let Err(err) = task.await {
                warn!("node task ended abnormally: {err}");
            }
        }
        let stopped = self.nodes.len();
        self.nodes.clear();
        self.set_loaded(FlowConfig::default());
        if let Ok(config) = self.current_config() {
            config
                .events
                .emit(FLOWS_STOPPED, json!({ "nodes": stopped }));
        }
        info!(nodes = stopped, "flows stopped");
        Ok(())
    }

    fn get_flows(&self) -> FlowConfig {
        self.loaded
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn clear_registry(&self) {
        self.types.clear();
        debug!("node registry cleared");
    }

    fn get_node(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    fn active_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        ids.sort();
        ids
    }

    fn settings(&self) -> Option<Arc<dyn Settings>> {
        self.current_config().ok().map(|c| c.settings)
    }
}

impl fmt::Debug for EmbeddedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedRegistry")
            .field("types", &self.registered_types())
            .field("active", &self.active_nodes())
            .finish()
    }
}

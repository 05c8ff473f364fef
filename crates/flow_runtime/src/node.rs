use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::context::{ContextStore, GLOBAL_SCOPE};
use crate::events::{EventBus, NODE_STATUS};
use crate::log::{LogLevel, LogRecord, RuntimeLog};
use crate::message::Message;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeError {
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown node type `{0}`")]
    UnknownType(String),
    #[error("node type `{0}` is already registered")]
    DuplicateType(String),
    #[error("{0}")]
    Failed(String),
}

/// Parsed view over one node record of a flow. The raw record is kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    pub node_type: String,
    pub z: Option<String>,
    pub name: Option<String>,
    pub wires: Vec<Vec<String>>,
    raw: Value,
}

impl NodeConfig {
    pub fn parse(raw: &Value) -> Result<Self, NodeError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| NodeError::InvalidConfig(format!("expected an object, got {raw}")))?;
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::InvalidConfig(format!("node without `id`: {raw}")))?;
        let node_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::InvalidConfig(format!("node `{id}` has no `type`")))?;
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let wires = match obj.get("wires") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(ports)) => ports
                .iter()
                .map(|port| match port {
                    Value::Array(ids) => ids
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    Value::String(id) => vec![id.clone()],
                    _ => Vec::new(),
                })
                .collect(),
            Some(other) => {
                return Err(NodeError::InvalidConfig(format!(
                    "node `{id}` has malformed wires: {other}"
                )));
            }
        };

        Ok(Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            z: text("z"),
            name: text("name"),
            wires,
            raw: raw.clone(),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    /// Tabs and subflow definitions group nodes, they never run.
    pub fn is_container(&self) -> bool {
        matches!(self.node_type.as_str(), "tab" | "subflow")
    }
}

/// A method of the base node type, called with the node it is invoked on.
pub type NodeMethod = Arc<dyn Fn(&Node, &[Value]) -> Value + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoration {
    Applied,
    AlreadyApplied,
    Missing,
}

/// Method table shared by every node of a runtime.
pub struct NodePrototype {
    methods: DashMap<String, NodeMethod>,
    decorations: DashSet<(String, String)>,
}

impl NodePrototype {
    pub fn empty() -> Self {
        Self {
            methods: DashMap::new(),
            decorations: DashSet::new(),
        }
    }

    /// The runtime's base node methods: logging, status and send.
    pub fn standard() -> Arc<Self> {
        let proto = Self::empty();
        proto.define("log", log_method(LogLevel::Info));
        proto.define("warn", log_method(LogLevel::Warn));
        proto.define("error", log_method(LogLevel::Error));
        proto.define("debug", log_method(LogLevel::Debug));
        proto.define("trace", log_method(LogLevel::Trace));
        proto.define("status", Arc::new(status_method));
        proto.define("send", Arc::new(send_method));
        Arc::new(proto)
    }

    /// (Re)defines a method, dropping any decoration applied to the old one.
    pub fn define(&self, name: &str, method: NodeMethod) {
        self.methods.insert(name.to_string(), method);
        self.decorations.retain(|(method, _)| method != name);
    }

    pub fn method(&self, name: &str) -> Option<NodeMethod> {
        self.methods.get(name).map(|m| m.value().clone())
    }

    pub fn has(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_decorated(&self, name: &str, tag: &str) -> bool {
        self.decorations
            .contains(&(name.to_string(), tag.to_string()))
    }

    /// Replaces `name` with `wrap(original)`. A given tag is applied at most
    /// once per method; missing methods are left alone.
    pub fn decorate<F>(&self, name: &str, tag: &str, wrap: F) -> Decoration
    where
        F: FnOnce(NodeMethod) -> NodeMethod,
    {
        let Some(mut entry) = self.methods.get_mut(name) else {
            return Decoration::Missing;
        };
        if !self.decorations.insert((name.to_string(), tag.to_string())) {
            return Decoration::AlreadyApplied;
        }
        let original = entry.value().clone();
        *entry.value_mut() = wrap(original);
        Decoration::Applied
    }
}

impl fmt::Debug for NodePrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePrototype")
            .field("methods", &self.names())
            .field("decorations", &self.decorations.len())
            .finish()
    }
}

fn log_method(level: LogLevel) -> NodeMethod {
    Arc::new(move |node: &Node, args: &[Value]| {
        let msg = args.first().cloned().unwrap_or(Value::Null);
        node.env().log.log(
            LogRecord::new(level, msg).with_node(node.id(), node.node_type(), node.name()),
        );
        Value::Null
    })
}

fn status_method(node: &Node, args: &[Value]) -> Value {
    let status = match args.first() {
        Some(Value::String(text)) => json!({ "text": text }),
        Some(other) => other.clone(),
        None => json!({}),
    };
    node.set_status(status.clone());
    node.env()
        .events
        .emit(NODE_STATUS, json!({ "id": node.id(), "status": status }));
    Value::Null
}

fn send_method(node: &Node, args: &[Value]) -> Value {
    if let Some(output) = args.first() {
        route(node, output);
    }
    Value::Null
}

/// A single value goes out of port 0, an array carries one entry per port.
fn route(node: &Node, output: &Value) {
    let Some(peers) = node.env().peers.upgrade() else {
        debug!(node = %node.id(), "node is not part of a running flow, dropping send");
        return;
    };
    let ports: Vec<&Value> = match output {
        Value::Array(ports) => ports.iter().collect(),
        single => vec![single],
    };
    for (port, out) in ports.into_iter().enumerate() {
        let Some(targets) = node.wires().get(port) else {
            continue;
        };
        let msgs: Vec<&Value> = match out {
            Value::Null => continue,
            Value::Array(many) => many.iter().filter(|m| !m.is_null()).collect(),
            one => vec![one],
        };
        for value in msgs {
            let mut msg = Message::from(value.clone());
            msg.ensure_id();
            for target in targets {
                let peer = peers.get(target).map(|p| p.value().clone());
                match peer {
                    Some(peer) => peer.receive(msg.clone()),
                    None => warn!(node = %node.id(), %target, "wired to a node that is not running"),
                }
            }
        }
    }
}

/// What a node type does with the messages it receives.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    async fn on_input(&self, node: &Node, msg: Message) -> Result<(), NodeError>;

    async fn on_close(&self, _node: &Node) {}
}

/// No behaviour beyond generic node construction.
pub struct Inert;

#[async_trait]
impl NodeBehavior for Inert {
    async fn on_input(&self, _node: &Node, _msg: Message) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Closure-backed input handler.
pub struct OnInput<F>(pub F);

#[async_trait]
impl<F> NodeBehavior for OnInput<F>
where
    F: Fn(&Node, Message) -> Result<(), NodeError> + Send + Sync,
{
    async fn on_input(&self, node: &Node, msg: Message) -> Result<(), NodeError> {
        (self.0)(node, msg)
    }
}

/// Builds the behaviour of a freshly constructed node of a registered type.
pub type NodeConstructor =
    Arc<dyn Fn(&Node) -> Result<Box<dyn NodeBehavior>, NodeError> + Send + Sync>;

pub fn constructor<F>(f: F) -> NodeConstructor
where
    F: Fn(&Node) -> Result<Box<dyn NodeBehavior>, NodeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Runtime services a node reaches through.
#[derive(Clone)]
pub struct NodeEnv {
    pub prototype: Arc<NodePrototype>,
    pub log: Arc<RuntimeLog>,
    pub events: EventBus,
    pub context: Arc<dyn ContextStore>,
    pub(crate) peers: Weak<DashMap<String, Node>>,
}

impl NodeEnv {
    pub fn new(
        prototype: Arc<NodePrototype>,
        log: Arc<RuntimeLog>,
        events: EventBus,
        context: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            prototype,
            log,
            events,
            context,
            peers: Weak::new(),
        }
    }

    pub(crate) fn with_peers(mut self, peers: &Arc<DashMap<String, Node>>) -> Self {
        self.peers = Arc::downgrade(peers);
        self
    }
}

/// Receiving end of a node's input queue, consumed by [`Node::spawn`].
pub struct Mailbox(mpsc::UnboundedReceiver<Message>);

/// One node instance. Cloning hands out another reference to the same node.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

struct NodeInner {
    config: NodeConfig,
    credentials: Option<Value>,
    env: NodeEnv,
    mailbox: mpsc::UnboundedSender<Message>,
    inputs: broadcast::Sender<Message>,
    status: RwLock<Option<Value>>,
}

impl Node {
    /// Generic node construction, no type specific behaviour attached yet.
    pub fn create(config: NodeConfig, credentials: Option<Value>, env: NodeEnv) -> (Node, Mailbox) {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let (inputs, _) = broadcast::channel(64);
        let node = Node(Arc::new(NodeInner {
            config,
            credentials,
            env,
            mailbox,
            inputs,
            status: RwLock::new(None),
        }));
        (node, Mailbox(rx))
    }

    /// Processes the mailbox in order until `cancel` fires, then closes the node.
    pub fn spawn(
        &self,
        mailbox: Mailbox,
        behavior: Box<dyn NodeBehavior>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let node = self.clone();
        let Mailbox(mut rx) = mailbox;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(msg) => node.process(behavior.as_ref(), msg).await,
                        None => break,
                    },
                }
            }
            behavior.on_close(&node).await;
            trace!(node = %node.id(), "node closed");
        })
    }

    async fn process(&self, behavior: &dyn NodeBehavior, msg: Message) {
        let _ = self.0.inputs.send(msg.clone());
        if let Err(err) = behavior.on_input(self, msg).await {
            self.error(err.to_string());
        }
    }

    pub fn id(&self) -> &str {
        &self.0.config.id
    }

    pub fn node_type(&self) -> &str {
        &self.0.config.node_type
    }

    pub fn name(&self) -> Option<&str> {
        self.0.config.name.as_deref()
    }

    pub fn z(&self) -> Option<&str> {
        self.0.config.z.as_deref()
    }

    pub fn wires(&self) -> &[Vec<String>] {
        &self.0.config.wires
    }

    pub fn config(&self) -> &NodeConfig {
        &self.0.config
    }

    pub fn credentials(&self) -> Option<&Value> {
        self.0.credentials.as_ref()
    }

    pub fn env(&self) -> &NodeEnv {
        &self.0.env
    }

    /// Invokes a prototype method. `None` when the prototype lacks it.
    pub fn call(&self, method: &str, args: &[Value]) -> Option<Value> {
        // clone the method out so the table is not locked while it runs
        let method_fn = self.0.env.prototype.method(method)?;
        Some(method_fn(self, args))
    }

    fn invoke(&self, method: &str, args: Vec<Value>) {
        if self.call(method, &args).is_none() {
            debug!(node = %self.id(), %method, "prototype has no such method");
        }
    }

    pub fn log(&self, msg: impl Into<Value>) {
        self.invoke("log", vec![msg.into()]);
    }

    pub fn warn(&self, msg: impl Into<Value>) {
        self.invoke("warn", vec![msg.into()]);
    }

    pub fn error(&self, msg: impl Into<Value>) {
        self.invoke("error", vec![msg.into()]);
    }

    pub fn debug(&self, msg: impl Into<Value>) {
        self.invoke("debug", vec![msg.into()]);
    }

    pub fn trace(&self, msg: impl Into<Value>) {
        self.invoke("trace", vec![msg.into()]);
    }

    pub fn status(&self, status: impl Into<Value>) {
        self.invoke("status", vec![status.into()]);
    }

    pub fn send(&self, msg: impl Into<Value>) {
        self.invoke("send", vec![msg.into()]);
    }

    /// Queues `msg` for this node's input handler.
    pub fn receive(&self, msg: impl Into<Message>) {
        let mut msg = msg.into();
        msg.ensure_id();
        if self.0.mailbox.send(msg).is_err() {
            debug!(node = %self.id(), "node is not running, message dropped");
        }
    }

    /// Every message this node receives, in arrival order.
    pub fn inputs(&self) -> broadcast::Receiver<Message> {
        self.0.inputs.subscribe()
    }

    pub fn last_status(&self) -> Option<Value> {
        self.read_status().clone()
    }

    fn read_status(&self) -> std::sync::RwLockReadGuard<'_, Option<Value>> {
        self.0
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: Value) {
        let mut guard = self
            .0
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(status);
    }

    pub fn context(&self) -> ScopedContext {
        ScopedContext::new(self.0.env.context.clone(), self.id())
    }

    pub fn flow_context(&self) -> Option<ScopedContext> {
        self.z()
            .map(|z| ScopedContext::new(self.0.env.context.clone(), z))
    }

    pub fn global_context(&self) -> ScopedContext {
        ScopedContext::new(self.0.env.context.clone(), GLOBAL_SCOPE)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("type", &self.node_type())
            .field("name", &self.name())
            .finish()
    }
}

/// A context store narrowed to one scope.
#[derive(Clone, Debug)]
pub struct ScopedContext {
    store: Arc<dyn ContextStore>,
    scope: String,
}

impl ScopedContext {
    pub fn new(store: Arc<dyn ContextStore>, scope: &str) -> Self {
        Self {
            store,
            scope: scope.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(&self.scope, key)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.store.set(&self.scope, key, value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store.remove(&self.scope, key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys(&self.scope)
    }
}

//! A small in-process flow runtime: node registry, runtime log, event bus,
//! context store, realtime comms and an administrative HTTP API.

pub mod admin;
pub mod comms;
pub mod context;
pub mod events;
pub mod log;
pub mod message;
pub mod node;
pub mod registry;
pub mod runtime;
pub mod storage;

pub use admin::{AdminApi, AdminOptions, EmbeddedAdmin};
pub use comms::{Comms, CommsMessage, EmbeddedComms};
pub use context::{ContextStore, GLOBAL_SCOPE, MemoryContext};
pub use events::{EventBus, RuntimeEvent};
pub use log::{LogLevel, LogRecord, LogSink, RuntimeLog};
pub use message::Message;
pub use node::{
    Decoration, Inert, Node, NodeBehavior, NodeConfig, NodeConstructor, NodeError, NodeMethod,
    NodePrototype, OnInput, constructor,
};
pub use registry::{EmbeddedRegistry, NodeRegistry, RegistryConfig};
pub use runtime::{EmbeddedRuntime, HostRuntime, RuntimeError, VERSION};
pub use storage::{FlowConfig, Settings, Storage};

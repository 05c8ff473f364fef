use std::net::SocketAddr;

use flow_runtime::{NodeError, RuntimeError};
use serde_json::Value;
use thiserror::Error;

use crate::helper::FlowState;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("no flow runtime is bound to the helper")]
    Unbound,
    #[error("a flow session is already active ({0})")]
    SessionActive(FlowState),
    #[error("loaded flows differ from the supplied flows")]
    FlowMismatch { expected: Vec<Value>, actual: Vec<Value> },
    #[error("node registration failed: {0}")]
    Registration(NodeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("server already listening on {0}")]
    ServerRunning(SocketAddr),
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("admin request failed: {0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, HelperError>;

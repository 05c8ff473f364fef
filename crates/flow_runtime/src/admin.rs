use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::log::{LogLevel, RuntimeLog};
use crate::registry::NodeRegistry;
use crate::runtime::{RuntimeError, VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLogging {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingOptions {
    pub console: ConsoleLogging,
}

/// Options the administrative API is initialised with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminOptions {
    pub skip_build_check: bool,
    pub logging: LoggingOptions,
}

impl AdminOptions {
    pub fn console_level(&self) -> Option<LogLevel> {
        LogLevel::parse(&self.logging.console.level)
    }

    /// Build check skipped, console logging off.
    pub fn quiet() -> Self {
        Self {
            skip_build_check: true,
            logging: LoggingOptions {
                console: ConsoleLogging {
                    level: "off".to_string(),
                },
            },
        }
    }
}

impl Default for AdminOptions {
    fn default() -> Self {
        Self {
            skip_build_check: false,
            logging: LoggingOptions {
                console: ConsoleLogging {
                    level: LogLevel::Info.name().to_string(),
                },
            },
        }
    }
}

pub trait AdminApi: Send + Sync + Debug {
    fn init(&self, options: AdminOptions) -> Result<(), RuntimeError>;
    fn options(&self) -> Option<AdminOptions>;
    fn router(&self) -> Router;
}

#[derive(Clone)]
struct AdminState {
    registry: Arc<dyn NodeRegistry>,
}

#[derive(Debug)]
pub struct EmbeddedAdmin {
    registry: Arc<dyn NodeRegistry>,
    log: Arc<RuntimeLog>,
    options: RwLock<Option<AdminOptions>>,
}

impl EmbeddedAdmin {
    pub fn new(registry: Arc<dyn NodeRegistry>, log: Arc<RuntimeLog>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            log,
            options: RwLock::new(None),
        })
    }
}

impl AdminApi for EmbeddedAdmin {
    fn init(&self, options: AdminOptions) -> Result<(), RuntimeError> {
        // the build check only asks whether the registry has been initialised
        if !options.skip_build_check && self.registry.settings().is_none() {
            return Err(RuntimeError::Admin(
                "build check failed: node registry is not initialised".to_string(),
            ));
        }
        self.log.set_console_level(options.console_level());
        info!(console = %options.logging.console.level, "admin api initialised");
        let mut guard = self.options.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(options);
        Ok(())
    }

    fn options(&self) -> Option<AdminOptions> {
        self.options
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/flows", get(flows))
            .route("/nodes", get(nodes))
            .route("/nodes/{id}", get(node))
            .route("/settings", get(settings))
            .with_state(AdminState {
                registry: self.registry.clone(),
            })
    }
}

async fn flows(State(state): State<AdminState>) -> Json<Vec<Value>> {
    Json(state.registry.get_flows().flows)
}

async fn nodes(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "types": state.registry.registered_types(),
        "active": state.registry.active_nodes(),
    }))
}

async fn node(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.registry.get_node(&id) {
        Some(node) => Ok(Json(node.config().raw().clone())),
        None => {
            debug!(%id, "admin lookup of unknown node");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

async fn settings(State(state): State<AdminState>) -> Json<Value> {
    let available = state
        .registry
        .settings()
        .map(|s| s.available())
        .unwrap_or(false);
    Json(json!({
        "version": VERSION,
        "available": available,
    }))
}

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use flow_runtime::{
    AdminApi, Comms, ContextStore, EmbeddedRuntime, EventBus, HostRuntime, NodePrototype,
    NodeRegistry, RuntimeLog,
};
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

/// Builds a runtime instance for the harness to bind to.
pub type RuntimeProvider = Arc<dyn Fn() -> anyhow::Result<Arc<dyn HostRuntime>> + Send + Sync>;

static PROVIDERS: Lazy<DashMap<String, RuntimeProvider>> = Lazy::new(|| {
    let providers: DashMap<String, RuntimeProvider> = DashMap::new();
    providers.insert(
        EmbeddedRuntime::NAME.to_string(),
        Arc::new(|| Ok(EmbeddedRuntime::new() as Arc<dyn HostRuntime>)),
    );
    providers
});

/// Makes a runtime available under `name` for later binding.
pub fn register_runtime<F>(name: &str, provider: F)
where
    F: Fn() -> anyhow::Result<Arc<dyn HostRuntime>> + Send + Sync + 'static,
{
    PROVIDERS.insert(name.to_string(), Arc::new(provider));
    debug!(runtime = %name, "runtime provider registered");
}

pub fn registered_runtimes() -> Vec<String> {
    let mut names: Vec<String> = PROVIDERS.iter().map(|p| p.key().clone()).collect();
    names.sort();
    names
}

/// The provider name a hint stands for: the hint itself, or the last
/// segment when it is written as a path.
pub fn provider_name(hint: &str) -> String {
    let trimmed = hint.trim().trim_end_matches(['/', '\\']);
    Path::new(trimmed)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(trimmed)
        .to_string()
}

/// The sub-handles of one bound runtime.
#[derive(Clone, Debug)]
pub struct Binding {
    pub runtime: Arc<dyn HostRuntime>,
    pub registry: Arc<dyn NodeRegistry>,
    pub events: EventBus,
    pub log: Arc<RuntimeLog>,
    pub context: Arc<dyn ContextStore>,
    pub comms: Arc<dyn Comms>,
    pub admin: Arc<dyn AdminApi>,
    pub prototype: Arc<NodePrototype>,
}

impl Binding {
    pub fn new(runtime: Arc<dyn HostRuntime>) -> Self {
        Self {
            registry: runtime.registry(),
            events: runtime.events(),
            log: runtime.log(),
            context: runtime.context(),
            comms: runtime.comms(),
            admin: runtime.admin(),
            prototype: runtime.prototype(),
            runtime,
        }
    }
}

/// Resolves `hint` (or the embedded runtime) to a fresh runtime instance.
/// Failures are logged and yield `None`.
pub fn resolve(hint: Option<&str>) -> Option<Binding> {
    let hint = hint.unwrap_or(EmbeddedRuntime::NAME);
    let name = provider_name(hint);
    let Some(provider) = PROVIDERS.get(&name).map(|p| p.value().clone()) else {
        warn!(%hint, known = ?registered_runtimes(), "no runtime provider matches hint");
        return None;
    };
    match catch_unwind(AssertUnwindSafe(|| provider())) {
        Ok(Ok(runtime)) => {
            info!(runtime = %runtime.name(), version = %runtime.version(), "runtime bound");
            Some(Binding::new(runtime))
        }
        Ok(Err(err)) => {
            warn!(%hint, "runtime provider failed: {err:#}");
            None
        }
        Err(_) => {
            warn!(%hint, "runtime provider panicked");
            None
        }
    }
}

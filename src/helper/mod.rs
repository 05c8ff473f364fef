//! The node test harness: binds an embedded flow runtime, loads a flow around
//! the node under test, republishes the node's calls as events and tears
//! everything down again between tests.

pub mod binder;
pub mod client;
pub mod events;
pub mod intercept;
pub mod log_spy;
pub(crate) mod server;
pub mod session;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use flow_runtime::{HostRuntime, Node};
use serde_json::{Map, Value};
use tracing::{info, warn};
use url::Url;

pub use binder::{Binding, RuntimeProvider, register_runtime};
pub use client::{AdminClient, AdminResponse};
pub use events::{CallRecord, EventSurface, Scheduler};
pub use intercept::{PROXY_METHODS, Sandbox};
pub use log_spy::LogSpy;
pub use session::{
    Capabilities, Credentials, FlowDefinition, FlowState, HELPER_TYPE, Registrations, register,
};

use crate::config::HelperConfig;
use crate::error::{HelperError, Result};
use crate::logger::{LogConfig, init_tracing};
use server::ServerHandle;

struct SessionSlot {
    state: FlowState,
    spy: Option<Arc<LogSpy>>,
}

pub struct NodeTestHelper {
    config: HelperConfig,
    binding: RwLock<Option<Binding>>,
    user_settings: RwLock<Map<String, Value>>,
    sandbox: Arc<Sandbox>,
    events: Arc<EventSurface>,
    session: Mutex<SessionSlot>,
    server: tokio::sync::Mutex<Option<ServerHandle>>,
    listening: RwLock<Option<(SocketAddr, Url)>>,
}

impl NodeTestHelper {
    /// A harness configured from the environment (and `.env`).
    pub fn new() -> Self {
        Self::with_config(HelperConfig::from_env())
    }

    /// A harness bound to the runtime named in `config` when it resolves.
    pub fn with_config(config: HelperConfig) -> Self {
        if let Err(err) = init_tracing(&LogConfig::from(&config)) {
            eprintln!("node test helper: logging not initialised: {err:#}");
        }
        let helper = Self {
            binding: RwLock::new(None),
            user_settings: RwLock::new(Map::new()),
            sandbox: Sandbox::new(),
            events: EventSurface::new(),
            session: Mutex::new(SessionSlot {
                state: FlowState::Unloaded,
                spy: None,
            }),
            server: tokio::sync::Mutex::new(None),
            listening: RwLock::new(None),
            config,
        };
        let hint = helper.config.runtime.clone();
        if let Err(err) = helper.init(hint.as_deref()) {
            warn!("initial runtime binding failed: {err}");
        }
        helper
    }

    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// Binds to the runtime `hint` names (the embedded one by default).
    /// Returns whether a runtime is bound afterwards.
    pub fn init(&self, hint: Option<&str>) -> Result<bool> {
        let state = self.state();
        if state != FlowState::Unloaded {
            return Err(HelperError::SessionActive(state));
        }
        let listening = self.listening().map(|(addr, _)| addr);
        if let Some(addr) = listening {
            return Err(HelperError::ServerRunning(addr));
        }

        let binding = binder::resolve(hint);
        if let Some(binding) = &binding {
            let wrapped = intercept::install(&binding.prototype, &self.sandbox, &self.events);
            info!(runtime = %binding.runtime.name(), ?wrapped, "interception installed");
        }
        let bound = binding.is_some();
        *self.binding.write().unwrap_or_else(|p| p.into_inner()) = binding;
        Ok(bound)
    }

    pub fn is_bound(&self) -> bool {
        self.binding
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    pub fn runtime(&self) -> Option<Arc<dyn HostRuntime>> {
        self.binding().ok().map(|b| b.runtime)
    }

    fn binding(&self) -> Result<Binding> {
        self.binding
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(HelperError::Unbound)
    }

    /// User settings served by the settings stand-in from the next `load` on.
    pub fn settings(&self, settings: Map<String, Value>) {
        *self
            .user_settings
            .write()
            .unwrap_or_else(|p| p.into_inner()) = settings;
    }

    pub fn state(&self) -> FlowState {
        self.slot().state
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, SessionSlot> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Moves the session from `from` to `to`, or reports the state it is in.
    fn transition(&self, from: FlowState, to: FlowState) -> Result<()> {
        let mut slot = self.slot();
        if slot.state != from {
            return Err(HelperError::SessionActive(slot.state));
        }
        slot.state = to;
        Ok(())
    }

    /// Loads and starts `flow` with the node types `registrations` provide.
    /// Resolves once the flow runs and round-trips unchanged.
    #[tracing::instrument(skip_all, fields(records = tracing::field::Empty))]
    pub async fn load(
        &self,
        registrations: Registrations,
        flow: impl Into<FlowDefinition>,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let binding = self.binding()?;
        let flow = flow.into();
        tracing::Span::current().record("records", flow.len());
        self.transition(FlowState::Unloaded, FlowState::Loading)?;

        let spy = LogSpy::attach(&binding.log);
        self.slot().spy = Some(spy);

        let user_settings = self
            .user_settings
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let started = session::start(
            &binding,
            user_settings,
            registrations,
            &flow,
            credentials.unwrap_or_default(),
        )
        .await;

        match started {
            Ok(()) => {
                self.slot().state = FlowState::Loaded;
                Ok(())
            }
            Err(err) => {
                warn!("load failed, rolling back: {err}");
                if let Err(teardown) = self.teardown(&binding).await {
                    warn!("rollback incomplete: {teardown}");
                }
                self.slot().state = FlowState::Unloaded;
                Err(err)
            }
        }
    }

    /// Tears the loaded flow down. A no-op when nothing is loaded.
    #[tracing::instrument(skip_all)]
    pub async fn unload(&self) -> Result<()> {
        if self.state() == FlowState::Unloaded {
            return Ok(());
        }
        self.transition(FlowState::Loaded, FlowState::Unloading)?;
        let binding = self.binding()?;
        let stopped = self.teardown(&binding).await;
        self.slot().state = FlowState::Unloaded;
        stopped
    }

    async fn teardown(&self, binding: &Binding) -> Result<()> {
        binding.registry.clear_registry();
        let spy = self.slot().spy.take();
        if let Some(spy) = spy {
            spy.restore(&binding.log);
        }
        self.sandbox.reset();
        // deliver what the session queued before its listeners go
        self.events.flush().await;
        self.events.remove_all_listeners(None);
        binding.context.clean(&[]);
        binding.registry.stop_flows().await?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.binding()?.registry.get_node(id))
    }

    /// Stops the running flows; registrations and log capture stay.
    pub async fn clear_flows(&self) -> Result<()> {
        self.binding()?.registry.stop_flows().await?;
        Ok(())
    }

    /// In-process client for the admin API.
    pub fn request(&self) -> Result<AdminClient> {
        Ok(AdminClient::new(self.binding()?.admin.router()))
    }

    /// Serves the admin API on an ephemeral loopback port.
    #[tracing::instrument(skip_all)]
    pub async fn start_server(&self) -> Result<SocketAddr> {
        let binding = self.binding()?;
        let mut server = self.server.lock().await;
        if let Some(running) = server.as_ref() {
            return Err(HelperError::ServerRunning(running.addr));
        }
        let handle = server::start(&binding, &self.config).await?;
        let addr = handle.addr;
        *self.listening.write().unwrap_or_else(|p| p.into_inner()) =
            Some((addr, handle.url.clone()));
        *server = Some(handle);
        Ok(addr)
    }

    /// Stops the admin server if one is listening. Never fails.
    #[tracing::instrument(skip_all)]
    pub async fn stop_server(&self) {
        let Some(handle) = self.server.lock().await.take() else {
            return;
        };
        *self.listening.write().unwrap_or_else(|p| p.into_inner()) = None;
        server::stop(handle, self.config.shutdown_grace).await;
    }

    /// Base URL of the admin server while it listens.
    pub fn url(&self) -> Option<Url> {
        self.listening().map(|(_, url)| url)
    }

    fn listening(&self) -> Option<(SocketAddr, Url)> {
        self.listening
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The log capture of the current session.
    pub fn log(&self) -> Option<Arc<LogSpy>> {
        self.slot().spy.clone()
    }

    pub fn events(&self) -> Arc<EventSurface> {
        self.events.clone()
    }

    /// Shorthand for `events().on(..)`. Listeners last until `unload()`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&CallRecord) + Send + Sync + 'static,
    {
        self.events.on(event, handler);
    }

    pub fn sandbox(&self) -> Arc<Sandbox> {
        self.sandbox.clone()
    }
}

impl Default for NodeTestHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeTestHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTestHelper")
            .field("bound", &self.is_bound())
            .field("state", &self.state())
            .field("url", &self.url())
            .finish()
    }
}

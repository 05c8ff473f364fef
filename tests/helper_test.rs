use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use node_test_helper::config::HelperConfig;
use node_test_helper::flow_runtime::{
    AdminApi, Comms, ContextStore, EmbeddedRuntime, EventBus, FlowConfig, HostRuntime, Message,
    Node, NodeConstructor, NodeError, NodePrototype, NodeRegistry, OnInput, RegistryConfig,
    RuntimeError, RuntimeLog, Settings, Storage, constructor,
};
use node_test_helper::{
    Credentials, FlowState, HelperError, LogSpy, NodeTestHelper, Registrations, register,
    register_runtime,
};
use serde_json::{Value, json};
use tokio::time::timeout;

fn new_helper() -> NodeTestHelper {
    NodeTestHelper::with_config(HelperConfig::default())
}

/// A node type that upper-cases string payloads and passes the message on.
fn upper_case() -> Registrations {
    register(|red| {
        red.register_type(
            "upper-case",
            constructor(|_| {
                Ok(Box::new(OnInput(
                    |node: &Node, mut msg: Message| -> Result<(), NodeError> {
                        let upper = msg
                            .payload()
                            .and_then(Value::as_str)
                            .map(str::to_uppercase)
                            .ok_or_else(|| NodeError::Failed("payload is not a string".into()))?;
                        msg.set_payload(json!(upper));
                        node.send(msg);
                        Ok(())
                    },
                )))
            }),
        )
    })
}

#[tokio::test]
async fn test_helper_node_loads_and_unloads() {
    let helper = new_helper();
    let flow = json!([{"id": "n1", "type": "helper", "wires": []}]);

    helper.load(Registrations::none(), flow, None).await.unwrap();
    assert_eq!(helper.state(), FlowState::Loaded);
    let n1 = helper.get_node("n1").unwrap().unwrap();
    assert_eq!(n1.node_type(), "helper");

    helper.unload().await.unwrap();
    let registry = helper.runtime().unwrap().registry();
    assert!(registry.get_flows().flows.is_empty());
    assert!(registry.registered_types().is_empty());
    assert!(registry.active_nodes().is_empty());
    assert_eq!(helper.state(), FlowState::Unloaded);
}

#[tokio::test]
async fn test_flows_round_trip_with_credentials() {
    let helper = new_helper();
    let flow = vec![
        json!({"id": "f1", "type": "tab", "label": "Flow 1"}),
        json!({"id": "n1", "type": "helper", "z": "f1", "name": "watcher", "wires": [[]], "extra": {"deep": [1, 2, 3]}}),
    ];
    let mut credentials = Credentials::new();
    credentials.insert("n1".into(), json!({"password": "hunter2"}));

    helper
        .load(Registrations::none(), flow.clone(), Some(credentials))
        .await
        .unwrap();

    let loaded = helper.runtime().unwrap().registry().get_flows();
    assert_eq!(loaded.flows, flow);
    let n1 = helper.get_node("n1").unwrap().unwrap();
    assert_eq!(n1.credentials(), Some(&json!({"password": "hunter2"})));
    assert!(helper.get_node("f1").unwrap().is_none());
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_reload_with_different_flow() {
    let helper = new_helper();
    helper
        .load(Registrations::none(), json!([{"id": "a", "type": "helper"}]), None)
        .await
        .unwrap();
    helper.unload().await.unwrap();

    helper
        .load(
            upper_case(),
            json!([
                {"id": "b", "type": "upper-case", "wires": [["c"]]},
                {"id": "c", "type": "helper"}
            ]),
            None,
        )
        .await
        .unwrap();
    assert!(helper.get_node("a").unwrap().is_none());

    let c = helper.get_node("c").unwrap().unwrap();
    let mut inputs = c.inputs();
    helper
        .get_node("b")
        .unwrap()
        .unwrap()
        .receive(json!({"payload": "shout", "topic": "t"}));
    let msg = timeout(Duration::from_secs(2), inputs.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload(), Some(&json!("SHOUT")));
    assert_eq!(msg.topic(), Some("t"));
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_failing_registration_prevents_loading() {
    let helper = new_helper();
    let later_ran = Arc::new(AtomicBool::new(false));
    let flag = later_ran.clone();
    let registrations = register(|_| Err(NodeError::Failed("bad node module".into()))).and(
        move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        },
    );

    let err = helper
        .load(registrations, json!([{"id": "n1", "type": "helper"}]), None)
        .await
        .unwrap_err();

    assert!(matches!(err, HelperError::Registration(NodeError::Failed(_))));
    assert!(!later_ran.load(Ordering::SeqCst));
    let registry = helper.runtime().unwrap().registry();
    assert!(registry.get_flows().flows.is_empty());
    assert!(registry.registered_types().is_empty());
    assert_eq!(helper.state(), FlowState::Unloaded);
    assert!(helper.log().is_none());

    // the harness is usable again after the rollback
    helper
        .load(Registrations::none(), json!([{"id": "n1", "type": "helper"}]), None)
        .await
        .unwrap();
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_load_while_loaded_is_rejected() {
    let helper = new_helper();
    helper
        .load(Registrations::none(), json!([]), None)
        .await
        .unwrap();
    let err = helper
        .load(Registrations::none(), json!([]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HelperError::SessionActive(FlowState::Loaded)));
    helper.unload().await.unwrap();
    // unloading twice is harmless
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_invalid_flow_record_rolls_back() {
    let helper = new_helper();
    let err = helper
        .load(Registrations::none(), json!([{"type": "helper"}]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HelperError::Runtime(_)));
    assert_eq!(helper.state(), FlowState::Unloaded);
}

#[tokio::test]
async fn test_unknown_type_is_logged_not_started() {
    let helper = new_helper();
    helper
        .load(
            Registrations::none(),
            json!([{"id": "n1", "type": "not-installed"}]),
            None,
        )
        .await
        .unwrap();

    assert!(helper.get_node("n1").unwrap().is_none());
    let spy = helper.log().unwrap();
    let warnings = spy.at_level(LogSpy::WARN);
    assert!(warnings.iter().any(|r| r.text().contains("not-installed")));
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_node_errors_are_captured_by_log_spy() {
    let helper = new_helper();
    helper
        .load(upper_case(), json!([{"id": "u", "type": "upper-case"}]), None)
        .await
        .unwrap();
    let u = helper.get_node("u").unwrap().unwrap();
    let mut inputs = u.inputs();

    u.receive(json!({"payload": 7}));
    timeout(Duration::from_secs(2), inputs.recv())
        .await
        .unwrap()
        .unwrap();
    helper.events().flush().await;

    let spy = helper.log().unwrap();
    let errors = spy.at_level(LogSpy::ERROR);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id.as_deref(), Some("u"));
    assert_eq!(errors[0].text(), "payload is not a string");
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_clear_flows_keeps_registrations() {
    let helper = new_helper();
    helper
        .load(upper_case(), json!([{"id": "u", "type": "upper-case"}]), None)
        .await
        .unwrap();
    helper.clear_flows().await.unwrap();

    let registry = helper.runtime().unwrap().registry();
    assert!(registry.active_nodes().is_empty());
    assert!(registry.registered_types().contains(&"upper-case".to_string()));
    assert!(helper.log().is_some());
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_context_is_cleaned_on_unload() {
    let helper = new_helper();
    helper
        .load(Registrations::none(), json!([{"id": "n1", "type": "helper"}]), None)
        .await
        .unwrap();
    let n1 = helper.get_node("n1").unwrap().unwrap();
    n1.context().set("count", json!(1));
    n1.global_context().set("shared", json!("kept"));

    helper.unload().await.unwrap();
    let context = helper.runtime().unwrap().context();
    assert!(context.get("n1", "count").is_none());
    assert_eq!(context.get("global", "shared"), Some(json!("kept")));
}

#[tokio::test]
async fn test_request_client_reads_admin_api() {
    let helper = new_helper();
    let flow = json!([{"id": "n1", "type": "helper", "wires": []}]);
    helper
        .load(Registrations::none(), flow.clone(), None)
        .await
        .unwrap();

    let client = helper.request().unwrap();
    let response = client.get("/flows").await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.json::<Value>().unwrap(), flow);

    let node = client.get("/nodes/n1").await.unwrap();
    assert_eq!(node.json::<Value>().unwrap()["type"], "helper");
    assert_eq!(client.get("/nodes/zz").await.unwrap().status, 404);
    helper.unload().await.unwrap();
}

/// Registry that reports every loaded record with an extra `rev` field.
#[derive(Debug)]
struct Rewriting(Arc<dyn NodeRegistry>);

#[async_trait]
impl NodeRegistry for Rewriting {
    fn init(&self, config: RegistryConfig) {
        self.0.init(config)
    }

    fn register_type(&self, name: &str, constructor: NodeConstructor) -> Result<(), NodeError> {
        self.0.register_type(name, constructor)
    }

    fn registered_types(&self) -> Vec<String> {
        self.0.registered_types()
    }

    async fn load_flows(&self) -> Result<(), RuntimeError> {
        self.0.load_flows().await
    }

    async fn start_flows(&self) -> Result<(), RuntimeError> {
        self.0.start_flows().await
    }

    async fn stop_flows(&self) -> Result<(), RuntimeError> {
        self.0.stop_flows().await
    }

    fn get_flows(&self) -> FlowConfig {
        let mut config = self.0.get_flows();
        for record in config.flows.iter_mut() {
            if let Some(record) = record.as_object_mut() {
                record.insert("rev".into(), json!(2));
            }
        }
        config
    }

    fn clear_registry(&self) {
        self.0.clear_registry()
    }

    fn get_node(&self, id: &str) -> Option<Node> {
        self.0.get_node(id)
    }

    fn active_nodes(&self) -> Vec<String> {
        self.0.active_nodes()
    }

    fn settings(&self) -> Option<Arc<dyn Settings>> {
        self.0.settings()
    }
}

#[derive(Debug)]
struct RewritingRuntime {
    inner: Arc<EmbeddedRuntime>,
    registry: Arc<dyn NodeRegistry>,
}

#[async_trait]
impl HostRuntime for RewritingRuntime {
    fn name(&self) -> &str {
        "rewriting"
    }

    fn version(&self) -> &str {
        self.inner.version()
    }

    fn registry(&self) -> Arc<dyn NodeRegistry> {
        self.registry.clone()
    }

    fn events(&self) -> EventBus {
        self.inner.events()
    }

    fn log(&self) -> Arc<RuntimeLog> {
        self.inner.log()
    }

    fn context(&self) -> Arc<dyn ContextStore> {
        self.inner.context()
    }

    fn comms(&self) -> Arc<dyn Comms> {
        self.inner.comms()
    }

    fn admin(&self) -> Arc<dyn AdminApi> {
        self.inner.admin()
    }

    fn prototype(&self) -> Arc<NodePrototype> {
        self.inner.prototype()
    }

    async fn init(
        &self,
        settings: Arc<dyn Settings>,
        storage: Arc<dyn Storage>,
    ) -> Result<(), RuntimeError> {
        self.inner.init(settings, storage).await
    }

    async fn start(&self) -> Result<(), RuntimeError> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<(), RuntimeError> {
        self.inner.stop().await
    }
}

#[tokio::test]
async fn test_flow_that_does_not_round_trip_is_rejected() {
    register_runtime("rewriting", || {
        let inner = EmbeddedRuntime::new();
        let registry: Arc<dyn NodeRegistry> = Arc::new(Rewriting(inner.registry()));
        Ok(Arc::new(RewritingRuntime { inner, registry }) as Arc<dyn HostRuntime>)
    });
    let helper = NodeTestHelper::with_config(HelperConfig {
        runtime: Some("/opt/runtimes/rewriting".into()),
        ..HelperConfig::default()
    });
    assert_eq!(helper.runtime().unwrap().name(), "rewriting");

    let flow = json!([{"id": "n1", "type": "helper", "wires": []}]);
    let err = helper
        .load(Registrations::none(), flow.clone(), None)
        .await
        .unwrap_err();

    match err {
        HelperError::FlowMismatch { expected, actual } => {
            assert_eq!(expected, vec![flow[0].clone()]);
            assert_eq!(actual.len(), 1);
            assert_eq!(actual[0]["rev"], 2);
        }
        other => panic!("expected a flow mismatch, got {other}"),
    }
    assert_eq!(helper.state(), FlowState::Unloaded);
    assert!(helper.log().is_none());
    assert!(helper.get_node("n1").unwrap().is_none());
    assert!(helper.runtime().unwrap().registry().registered_types().is_empty());
}

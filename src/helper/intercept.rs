use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use flow_runtime::{Decoration, Node, NodeMethod, NodePrototype};
use serde_json::Value;
use tracing::debug;

use super::events::{CallRecord, EventSurface};

/// Node methods whose calls are republished as `call:<method>` events.
pub const PROXY_METHODS: [&str; 7] = ["log", "status", "warn", "error", "debug", "trace", "send"];

/// Tag marking the wrapping on a prototype.
pub const DECORATION_TAG: &str = "node-test-helper";

/// Ordered history of intercepted calls.
#[derive(Debug, Default)]
pub struct Sandbox {
    history: Mutex<Vec<CallRecord>>,
    seq: AtomicU64,
}

impl Sandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record(&self, method: &str, args: &[Value], node: &Node) -> CallRecord {
        let record = CallRecord {
            method: method.to_string(),
            args: args.to_vec(),
            node_id: node.id().to_string(),
            node_type: node.node_type().to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
        };
        self.history().push(record.clone());
        record
    }

    fn history(&self) -> std::sync::MutexGuard<'_, Vec<CallRecord>> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.history().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<CallRecord> {
        self.history()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.history().iter().filter(|r| r.method == method).count()
    }

    pub fn last_call(&self, method: &str) -> Option<CallRecord> {
        self.history()
            .iter()
            .rev()
            .find(|r| r.method == method)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }

    /// Forgets the history. The wrapping stays installed.
    pub fn reset(&self) {
        self.history().clear();
    }
}

/// Wraps every [`PROXY_METHODS`] entry of `prototype`. Returns the methods
/// wrapped by this call; already wrapped and missing methods are skipped.
pub fn install(
    prototype: &NodePrototype,
    sandbox: &Arc<Sandbox>,
    events: &Arc<EventSurface>,
) -> Vec<&'static str> {
    let mut wrapped = Vec::new();
    for method in PROXY_METHODS {
        let sandbox = sandbox.clone();
        let events = events.clone();
        let outcome = prototype.decorate(method, DECORATION_TAG, move |original| -> NodeMethod {
            Arc::new(move |node: &Node, args: &[Value]| {
                let result = original(node, args);
                events.emit_deferred(sandbox.record(method, args, node));
                result
            })
        });
        match outcome {
            Decoration::Applied => wrapped.push(method),
            Decoration::AlreadyApplied => debug!(%method, "method already intercepted"),
            Decoration::Missing => debug!(%method, "prototype has no such method, not intercepted"),
        }
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_runtime::node::NodeEnv;
    use flow_runtime::{EventBus, MemoryContext, NodeConfig, RuntimeLog};
    use serde_json::json;

    fn node(prototype: Arc<NodePrototype>) -> Node {
        let env = NodeEnv::new(prototype, RuntimeLog::new(), EventBus::new(), MemoryContext::new());
        let config = NodeConfig::parse(&json!({"id": "n1", "type": "helper"})).unwrap();
        Node::create(config, None, env).0
    }

    #[tokio::test]
    async fn test_install_wraps_once() {
        let prototype = NodePrototype::standard();
        let sandbox = Sandbox::new();
        let events = EventSurface::new();

        assert_eq!(install(&prototype, &sandbox, &events), PROXY_METHODS.to_vec());
        assert!(install(&prototype, &sandbox, &events).is_empty());

        let n1 = node(prototype);
        n1.log("once");
        assert_eq!(sandbox.call_count("log"), 1);
    }

    #[tokio::test]
    async fn test_missing_methods_are_skipped() {
        let prototype = Arc::new(NodePrototype::empty());
        prototype.define("log", Arc::new(|_: &Node, _: &[Value]| Value::Null));
        let wrapped = install(&prototype, &Sandbox::new(), &EventSurface::new());
        assert_eq!(wrapped, vec!["log"]);
    }

    #[tokio::test]
    async fn test_calls_are_recorded_and_reset() {
        let prototype = NodePrototype::standard();
        let sandbox = Sandbox::new();
        install(&prototype, &sandbox, &EventSurface::new());
        let n1 = node(prototype);

        n1.warn("careful");
        n1.status(json!({"fill": "red"}));
        n1.warn("again");

        assert_eq!(sandbox.len(), 3);
        assert_eq!(sandbox.calls_to("warn").len(), 2);
        let last = sandbox.last_call("warn").unwrap();
        assert_eq!(last.args, vec![json!("again")]);
        assert_eq!(last.node_id, "n1");
        assert_eq!(sandbox.calls()[1].method, "status");

        sandbox.reset();
        assert!(sandbox.is_empty());
        n1.warn("still wrapped");
        assert_eq!(sandbox.call_count("warn"), 1);
    }
}

use std::sync::{Arc, Mutex};

use node_test_helper::config::HelperConfig;
use node_test_helper::{CallRecord, NodeTestHelper, PROXY_METHODS, Registrations};
use serde_json::json;

fn new_helper() -> NodeTestHelper {
    NodeTestHelper::with_config(HelperConfig::default())
}

async fn loaded() -> NodeTestHelper {
    let helper = new_helper();
    helper
        .load(
            Registrations::none(),
            json!([
                {"id": "n1", "type": "helper", "wires": [["n2"]]},
                {"id": "n2", "type": "helper", "wires": []}
            ]),
            None,
        )
        .await
        .unwrap();
    helper
}

fn collect(helper: &NodeTestHelper, event: &str) -> Arc<Mutex<Vec<CallRecord>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    helper.on(event, move |record| sink.lock().unwrap().push(record.clone()));
    seen
}

#[tokio::test]
async fn test_call_event_arrives_after_call_returns() {
    let helper = loaded().await;
    let seen = collect(&helper, "call:log");
    let n1 = helper.get_node("n1").unwrap().unwrap();

    n1.log("hello");
    assert!(seen.lock().unwrap().is_empty());

    helper.events().flush().await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].args, vec![json!("hello")]);
    assert_eq!(seen[0].node_id, "n1");
    assert_eq!(seen[0].event(), "call:log");
    drop(seen);
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_every_proxied_method_emits_exactly_once() {
    let helper = loaded().await;
    let mut all = helper.events().subscribe();
    let n1 = helper.get_node("n1").unwrap().unwrap();

    n1.log("l");
    n1.status(json!({"fill": "green", "shape": "dot", "text": "ok"}));
    n1.warn("w");
    n1.error("e");
    n1.debug("d");
    n1.trace("t");
    n1.send(json!({"payload": 1}));
    helper.events().flush().await;

    let mut methods = Vec::new();
    while let Ok(record) = all.try_recv() {
        methods.push(record.method);
    }
    assert_eq!(methods, PROXY_METHODS.to_vec());
    assert_eq!(helper.sandbox().len(), PROXY_METHODS.len());
    assert_eq!(
        helper.sandbox().last_call("status").unwrap().args,
        vec![json!({"fill": "green", "shape": "dot", "text": "ok"})]
    );
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_wrapped_methods_keep_their_behaviour() {
    let helper = loaded().await;
    let n1 = helper.get_node("n1").unwrap().unwrap();
    let n2 = helper.get_node("n2").unwrap().unwrap();
    let mut n2_inputs = n2.inputs();

    n1.status("busy");
    n1.send(json!({"payload": "through"}));

    assert_eq!(n1.last_status(), Some(json!({"text": "busy"})));
    let msg = n2_inputs.recv().await.unwrap();
    assert_eq!(msg.payload(), Some(&json!("through")));
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_unload_resets_history_but_keeps_interception() {
    let helper = loaded().await;
    helper.get_node("n1").unwrap().unwrap().warn("first session");
    assert_eq!(helper.sandbox().call_count("warn"), 1);
    helper.unload().await.unwrap();
    assert!(helper.sandbox().is_empty());

    helper
        .load(Registrations::none(), json!([{"id": "n3", "type": "helper"}]), None)
        .await
        .unwrap();
    let seen = collect(&helper, "call:warn");
    helper.get_node("n3").unwrap().unwrap().warn("second session");
    helper.events().flush().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(helper.sandbox().call_count("warn"), 1);
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_rebinding_does_not_double_wrap() {
    let helper = new_helper();
    let prototype = helper.runtime().unwrap().prototype();
    // installing again on the same prototype is a no-op
    assert!(
        node_test_helper::helper::intercept::install(
            &prototype,
            &helper.sandbox(),
            &helper.events()
        )
        .is_empty()
    );

    helper
        .load(Registrations::none(), json!([{"id": "n1", "type": "helper"}]), None)
        .await
        .unwrap();
    let seen = collect(&helper, "call:debug");
    helper.get_node("n1").unwrap().unwrap().debug("once");
    helper.events().flush().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_panicking_listener_does_not_block_others() {
    let helper = loaded().await;
    helper.on("call:log", |_| panic!("listener failure"));
    let seen = collect(&helper, "call:log");

    helper.get_node("n1").unwrap().unwrap().log("still delivered");
    helper.events().flush().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    helper.unload().await.unwrap();
}

#[tokio::test]
async fn test_listeners_do_not_outlive_their_session() {
    let helper = loaded().await;
    let seen = collect(&helper, "call:log");
    helper.get_node("n1").unwrap().unwrap().log("session A");
    helper.unload().await.unwrap();

    // the queued record reached the listener before unload returned
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(helper.events().listener_count("call:log"), 0);

    helper
        .load(Registrations::none(), json!([{"id": "n1", "type": "helper"}]), None)
        .await
        .unwrap();
    helper.get_node("n1").unwrap().unwrap().log("session B");
    helper.events().flush().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].args, vec![json!("session A")]);
    drop(seen);
    helper.unload().await.unwrap();
}

//! Run one flow node inside an embedded flow runtime and watch what it does.
//!
//! ```no_run
//! use node_test_helper::{Registrations, helper};
//! use serde_json::json;
//!
//! # async fn demo() -> node_test_helper::Result<()> {
//! let h = helper();
//! h.load(Registrations::none(), json!([{"id": "n1", "type": "helper", "wires": []}]), None)
//!     .await?;
//! let n1 = h.get_node("n1")?.expect("n1 is running");
//! n1.log("hello");
//! h.events().flush().await;
//! assert_eq!(h.sandbox().call_count("log"), 1);
//! h.unload().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod helper;
pub mod logger;

use once_cell::sync::Lazy;

pub use error::{HelperError, Result};
pub use flow_runtime;
pub use helper::{
    AdminClient, AdminResponse, CallRecord, Capabilities, Credentials, EventSurface,
    FlowDefinition, FlowState, HELPER_TYPE, LogSpy, NodeTestHelper, PROXY_METHODS, Registrations,
    Sandbox, register, register_runtime,
};

static HELPER: Lazy<NodeTestHelper> = Lazy::new(NodeTestHelper::new);

/// The process-wide harness, built from the environment on first use.
pub fn helper() -> &'static NodeTestHelper {
    &HELPER
}

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

pub const GLOBAL_SCOPE: &str = "global";

/// Per-node (and per-flow) execution context.
pub trait ContextStore: Send + Sync + Debug {
    fn get(&self, scope: &str, key: &str) -> Option<Value>;
    fn set(&self, scope: &str, key: &str, value: Value);
    fn remove(&self, scope: &str, key: &str) -> Option<Value>;
    fn keys(&self, scope: &str) -> Vec<String>;
    /// Drops every scope that is neither global nor listed in `active_nodes`.
    fn clean(&self, active_nodes: &[String]);
}

#[derive(Debug, Default)]
pub struct MemoryContext {
    scopes: DashMap<String, DashMap<String, Value>>,
}

impl MemoryContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

impl ContextStore for MemoryContext {
    fn get(&self, scope: &str, key: &str) -> Option<Value> {
        self.scopes
            .get(scope)
            .and_then(|entries| entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, scope: &str, key: &str, value: Value) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn remove(&self, scope: &str, key: &str) -> Option<Value> {
        self.scopes
            .get(scope)
            .and_then(|entries| entries.remove(key).map(|(_, v)| v))
    }

    fn keys(&self, scope: &str) -> Vec<String> {
        self.scopes
            .get(scope)
            .map(|entries| entries.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    fn clean(&self, active_nodes: &[String]) {
        let keep: HashSet<&str> = active_nodes.iter().map(String::as_str).collect();
        self.scopes
            .retain(|scope, _| scope == GLOBAL_SCOPE || keep.contains(scope.as_str()));
        debug!(remaining = self.scopes.len(), "context cleaned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set_remove() {
        let ctx = MemoryContext::new();
        assert!(ctx.get("n1", "count").is_none());

        ctx.set("n1", "count", json!(1));
        assert_eq!(ctx.get("n1", "count"), Some(json!(1)));
        assert_eq!(ctx.keys("n1"), vec!["count".to_string()]);

        assert_eq!(ctx.remove("n1", "count"), Some(json!(1)));
        assert!(ctx.get("n1", "count").is_none());
    }

    #[test]
    fn test_clean_keeps_global_and_active() {
        let ctx = MemoryContext::new();
        ctx.set("n1", "a", json!(1));
        ctx.set("n2", "a", json!(2));
        ctx.set(GLOBAL_SCOPE, "a", json!(3));

        ctx.clean(&["n2".to_string()]);
        assert!(ctx.get("n1", "a").is_none());
        assert_eq!(ctx.get("n2", "a"), Some(json!(2)));
        assert_eq!(ctx.get(GLOBAL_SCOPE, "a"), Some(json!(3)));

        ctx.clean(&[]);
        assert_eq!(ctx.scope_count(), 1);
    }
}

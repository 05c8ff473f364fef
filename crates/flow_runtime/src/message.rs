use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message travelling along the wires of a flow.
///
/// Messages are plain JSON objects. The runtime only cares about `_msgid`,
/// everything else (`payload`, `topic`, ...) belongs to the nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub const ID: &'static str = "_msgid";

    pub fn new(payload: Value) -> Self {
        let mut msg = Self(Map::new());
        msg.set("payload", payload);
        msg.ensure_id();
        msg
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(Self::ID).and_then(Value::as_str)
    }

    /// Give the message an id unless it already carries one.
    pub fn ensure_id(&mut self) -> &str {
        if !matches!(self.0.get(Self::ID), Some(Value::String(_))) {
            self.0.insert(
                Self::ID.to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        self.id().unwrap_or_default()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.0.get("payload")
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.set("payload", payload);
    }

    pub fn topic(&self) -> Option<&str> {
        self.0.get("topic").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Objects become the message itself, anything else is wrapped as `payload`.
impl From<Value> for Message {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Message(map),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                Message(map)
            }
        }
    }
}

impl From<Message> for Value {
    fn from(msg: Message) -> Self {
        msg.into_value()
    }
}

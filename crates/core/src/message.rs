use serde::{Deserialize, Serialize};

/// A message travelling over the bus. Never mutated after publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub sender: String,
    pub timestamp_ms: i64,
}

impl Message {
    pub fn new(topic: &str, data: serde_json::Value, sender: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            data,
            sender: sender.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Convenience accessor for string fields of an object payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// Well-known topic names.
pub mod topics {
    pub const WILDCARD: &str = "*";
    pub const STATE_CHANGED: &str = "state_changed";
    pub const SYSTEM: &str = "system";
    pub const CORE_COMMAND: &str = "core_command";
    pub const CORE_RESPONSE: &str = "core_response";
    pub const MODULE_LOADED: &str = "module_loaded";
    pub const MODULE_UNLOADED: &str = "module_unloaded";
    pub const AGENT_LOADED: &str = "agent_loaded";
    pub const AGENT_UNLOADED: &str = "agent_unloaded";
}

use crate::bus::MessageBus;
use alfred_core::topics;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, Span};

const SENDER: &str = "state_manager";

/// Shared key/value store that announces changes on the bus.
#[derive(Clone)]
pub struct StateManager {
    state: Arc<RwLock<HashMap<String, Value>>>,
    bus: MessageBus,
    span: Span,
}

impl StateManager {
    pub fn new(bus: MessageBus) -> Self {
        Self::with_span(bus, tracing::info_span!("state"))
    }

    pub fn with_span(bus: MessageBus, span: Span) -> Self {
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
            bus,
            span,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Stores `value` under `key`. Returns true if the stored value changed.
    ///
    /// With `publish`, a change emits `state_changed` carrying
    /// `{key, old_value, new_value}`. Setting an identical value is silent.
    pub fn set(&self, key: &str, value: Value, publish: bool) -> bool {
        let old_value = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.get(key) == Some(&value) {
                return false;
            }
            state.insert(key.to_string(), value.clone())
        };

        debug!(parent: &self.span, key = %key, "State changed");
        if publish {
            self.bus.publish(
                topics::STATE_CHANGED,
                json!({
                    "key": key,
                    "old_value": old_value.unwrap_or(Value::Null),
                    "new_value": value,
                }),
                SENDER,
            );
        }
        true
    }

    /// Applies `set` with publishing for every entry.
    pub fn update<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (key, value) in entries {
            self.set(&key, value, true);
        }
    }

    /// Detached copy of the whole store.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Deletes `key`, announcing the removal with a null `new_value`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let old_value = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)?;
        debug!(parent: &self.span, key = %key, "State removed");
        self.bus.publish(
            topics::STATE_CHANGED,
            json!({ "key": key, "old_value": old_value.clone(), "new_value": Value::Null }),
            SENDER,
        );
        Some(old_value)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

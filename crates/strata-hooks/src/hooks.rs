//! Event context and handler results.
//!
//! The host decides which events exist. Record lifecycle events follow the
//! `records.<action>` naming (`records.create`, `records.update`, ...), custom
//! routes use `route:<METHOD> <path>`; any other name is allowed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Prefix of events bound through `route(...)` in scripts.
pub const ROUTE_EVENT_PREFIX: &str = "route:";

/// Build the event name for a custom route.
pub fn route_event(method: &str, path: &str) -> String {
    format!("{ROUTE_EVENT_PREFIX}{} {path}", method.to_ascii_uppercase())
}

/// Context handed to every handler of a dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookContext {
    /// Event name being dispatched.
    pub event: String,

    /// Event payload.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl HookContext {
    /// Create an empty context for an event.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: BTreeMap::new(),
        }
    }

    /// Set a value in the context.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Builder form of [`HookContext::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a value from the context.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The whole context as a script-visible object.
    pub fn to_value(&self) -> Value {
        let mut obj = BTreeMap::new();
        obj.insert("event".to_string(), Value::String(self.event.clone()));
        obj.insert("data".to_string(), Value::Object(self.data.clone()));
        Value::Object(obj)
    }
}

/// Result returned by a hook handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    /// Whether a handler ran.
    pub handled: bool,

    /// Whether the host should skip its default behavior.
    pub prevent_default: bool,

    /// Whether the remaining handlers of this dispatch are skipped.
    pub stop_propagation: bool,

    /// Return value from the handler (if any).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl HookResult {
    /// Create a successful result.
    pub fn ok() -> Self {
        Self {
            handled: true,
            ..Default::default()
        }
    }

    /// Create a result with a return value.
    pub fn with_value(value: impl Into<Value>) -> Self {
        Self {
            handled: true,
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Mark this result as preventing default behavior.
    pub fn prevent_default(mut self) -> Self {
        self.prevent_default = true;
        self
    }

    /// Mark this result as stopping propagation.
    pub fn stop_propagation(mut self) -> Self {
        self.stop_propagation = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_event_name() {
        assert_eq!(route_event("get", "/api/stats"), "route:GET /api/stats");
    }

    #[test]
    fn test_context_to_value() {
        let ctx = HookContext::new("records.create").with("collection", "users");
        let value = ctx.to_value();
        assert_eq!(value.get("event").and_then(Value::as_str), Some("records.create"));
        assert_eq!(
            value.get("data").and_then(|d| d.get("collection")).and_then(Value::as_str),
            Some("users")
        );
    }
}

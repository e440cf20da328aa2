//! Flow-Scoped Logging
//!
//! A thin structured layer over the `log` facade. Each [`FlowLogger`]
//! carries a list of `key=value` fields that are stamped onto every line it
//! emits, and [`FlowLogger::child`] derives a logger with one more field.
//! The engine gives every execution a root logger carrying the flow id and
//! hands each step a child carrying the step name.

use std::fmt;
use std::sync::Arc;

use log::Level;

/// Log target used for all flow-scoped lines.
pub const FLOW_TARGET: &str = "flowrunner::flow";

/// Structured logger with inherited context fields.
#[derive(Clone, Default)]
pub struct FlowLogger {
    fields: Arc<Vec<(String, String)>>,
}

impl FlowLogger {
    /// Creates a logger with no fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a logger stamped with a flow id.
    pub fn for_flow(flow_id: &str) -> Self {
        Self::new().child("flow_id", flow_id)
    }

    /// Returns a new logger with an extra field appended.
    ///
    /// Re-using a key overrides the inherited value.
    pub fn child(&self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        let key = key.into();
        let mut fields: Vec<(String, String)> = self
            .fields
            .iter()
            .filter(|(k, _)| *k != key)
            .cloned()
            .collect();
        fields.push((key, value.to_string()));
        Self {
            fields: Arc::new(fields),
        }
    }

    /// Looks up a field value.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns all fields in insertion order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Renders the fields as a `[k=v k=v]` prefix.
    pub fn prefix(&self) -> String {
        if self.fields.is_empty() {
            return String::new();
        }
        let rendered: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("[{}]", rendered.join(" "))
    }

    pub fn log(&self, level: Level, message: impl fmt::Display) {
        if log::log_enabled!(target: FLOW_TARGET, level) {
            log::log!(target: FLOW_TARGET, level, "{} {}", self.prefix(), message);
        }
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::Error, message);
    }
}

impl fmt::Debug for FlowLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowLogger")
            .field("fields", &self.prefix())
            .finish()
    }
}

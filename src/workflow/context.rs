//! Workflow Context
//!
//! The read-only view of one execution handed to every handler: the flow
//! id, the input data, the results of steps that have already completed,
//! propagation metadata and a flow-scoped logger.
//!
//! A context is never mutated once built. The engine produces a fresh
//! snapshot whenever new results become visible, so parallel siblings share
//! one snapshot and never see each other's output.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::monitoring::FlowLogger;

/// Propagation metadata for one execution.
///
/// Travels with distributed jobs so remote log lines carry the same fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowMeta {
    /// Execution id
    pub flow_id: String,

    /// Name of the workflow being executed
    pub workflow: String,

    /// When the execution was requested
    pub started_at: DateTime<Utc>,

    /// Free-form logging/tracing fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl FlowMeta {
    /// Creates metadata with a freshly generated flow id.
    pub fn new(workflow: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), workflow)
    }

    /// Creates metadata for a known flow id.
    pub fn with_id(flow_id: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            workflow: workflow.into(),
            started_at: Utc::now(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a propagation field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builds the root logger for this execution.
    pub fn logger(&self) -> FlowLogger {
        self.fields.iter().fold(
            FlowLogger::for_flow(&self.flow_id).child("workflow", &self.workflow),
            |logger, (k, v)| logger.child(k.as_str(), v),
        )
    }
}

/// Step outputs keyed by step name, in completion order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct StepResults(Arc<IndexMap<String, Value>>);

impl StepResults {
    /// Appends a result. Existing entries keep their position.
    pub(crate) fn insert(&mut self, step: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.0).insert(step.into(), value);
    }

    pub fn get(&self, step: &str) -> Option<&Value> {
        self.0.get(step)
    }

    /// Deserializes one step's output.
    pub fn get_as<T: DeserializeOwned>(&self, step: &str) -> Option<Result<T, serde_json::Error>> {
        self.0.get(step).map(|v| T::deserialize(v))
    }

    pub fn contains(&self, step: &str) -> bool {
        self.0.contains_key(step)
    }

    /// Step names in completion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the results as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Immutable per-execution context passed to handlers.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    meta: FlowMeta,
    data: Arc<Value>,
    results: StepResults,
    logger: FlowLogger,
}

impl WorkflowContext {
    pub(crate) fn new(meta: FlowMeta, data: Arc<Value>, results: StepResults, logger: FlowLogger) -> Self {
        Self {
            meta,
            data,
            results,
            logger,
        }
    }

    /// Copy of this context whose logger is scoped to one step.
    pub(crate) fn scoped(&self, key: &str, value: &str) -> Arc<Self> {
        Arc::new(Self {
            logger: self.logger.child(key, value),
            ..self.clone()
        })
    }

    pub fn flow_id(&self) -> &str {
        &self.meta.flow_id
    }

    pub fn meta(&self) -> &FlowMeta {
        &self.meta
    }

    /// Input data of the execution.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub(crate) fn shared_data(&self) -> Arc<Value> {
        self.data.clone()
    }

    /// Deserializes the input data.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.data.as_ref())
    }

    /// Results of steps that completed before this snapshot was taken.
    pub fn results(&self) -> &StepResults {
        &self.results
    }

    /// Output of a previously completed step.
    pub fn result(&self, step: &str) -> Option<&Value> {
        self.results.get(step)
    }

    pub fn logger(&self) -> &FlowLogger {
        &self.logger
    }
}

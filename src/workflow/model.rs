//! Workflow Data Model
//!
//! Core data structures describing a saga: ordered step groups, the handler
//! pair bound to each step name, and the completion hooks.
//!
//! The *layout* (names and groups) is plain data and can be loaded from
//! YAML. Handlers are bound in code, and [`WorkflowBuilder::build`] checks
//! that every step has exactly one handler before anything can run.
//!
//! # Example YAML Layout
//!
//! ```yaml
//! name: place_order
//! step_groups:
//!   - mode: sequential
//!     steps: [charge, reserve]
//!   - mode: parallel
//!     steps: [ship, notify]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::{FlowMeta, StepResults, WorkflowContext};
use super::validator::validate_definition;
use crate::error::{FlowError, StepError};

/// Forward action of a step.
pub type ExecuteFn =
    Arc<dyn Fn(Arc<WorkflowContext>) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

/// Compensating action of a step.
pub type RollbackFn =
    Arc<dyn Fn(Arc<WorkflowContext>) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// Called with `(input, meta, results)` once every group succeeded.
pub type CompleteFn = Arc<
    dyn Fn(Arc<Value>, FlowMeta, StepResults) -> BoxFuture<'static, Result<Value, StepError>>
        + Send
        + Sync,
>;

/// Called with `(input, meta, error, results)` after rollback finished.
pub type ErrorFn = Arc<
    dyn Fn(Arc<Value>, FlowMeta, FlowError, StepResults) -> BoxFuture<'static, ()> + Send + Sync,
>;

/// Concurrency mode of a step group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Steps run one at a time, in declared order
    #[default]
    Sequential,
    /// Steps start together; the group waits for all of them to settle
    Parallel,
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// A unit of workflow structure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepGroup {
    /// How the steps in this group are scheduled
    #[serde(default)]
    pub mode: GroupMode,

    /// Step names, in declared order
    #[serde(deserialize_with = "single_or_vec", default)]
    pub steps: Vec<String>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl StepGroup {
    /// Creates a group with an explicit mode.
    pub fn new<I, S>(mode: GroupMode, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode,
            steps: steps.into_iter().map(|s| s.into().trim().to_string()).collect(),
        }
    }

    /// Creates a sequential group.
    pub fn sequential<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(GroupMode::Sequential, steps)
    }

    /// Creates a parallel group.
    pub fn parallel<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(GroupMode::Parallel, steps)
    }

    pub fn is_parallel(&self) -> bool {
        self.mode == GroupMode::Parallel
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Declarative structure of a workflow, without handlers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkflowLayout {
    /// Workflow name, also used for queue routing
    pub name: String,

    /// Optional human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Groups in execution order
    #[serde(default)]
    pub step_groups: Vec<StepGroup>,
}

impl WorkflowLayout {
    /// Creates an empty layout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            description: None,
            step_groups: Vec::new(),
        }
    }

    /// Appends a group.
    pub fn with_group(mut self, group: StepGroup) -> Self {
        self.step_groups.push(group);
        self
    }

    /// Iterates over every step name in declared order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.step_groups
            .iter()
            .flat_map(|g| g.steps.iter().map(String::as_str))
    }

    /// Total number of steps across all groups.
    pub fn step_count(&self) -> usize {
        self.step_groups.iter().map(StepGroup::len).sum()
    }

    /// Returns true if the layout declares no steps.
    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }
}

/// Execute and optional rollback handlers for one step.
#[derive(Clone)]
pub struct StepHandler {
    execute: ExecuteFn,
    rollback: Option<RollbackFn>,
}

impl StepHandler {
    /// Creates a handler with no compensation.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::StepHandler;
    /// use flowrunner::StepError;
    /// use serde_json::json;
    ///
    /// let handler = StepHandler::new(|ctx| async move {
    ///     Ok::<_, StepError>(json!({ "charged": ctx.data()["amount"] }))
    /// })
    /// .with_rollback(|_ctx| async move { Ok::<_, StepError>(()) });
    ///
    /// assert!(handler.has_rollback());
    /// ```
    pub fn new<F, Fut>(execute: F) -> Self
    where
        F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self {
            execute: Arc::new(move |ctx| execute(ctx).boxed()),
            rollback: None,
        }
    }

    /// Attaches a compensating action.
    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move |ctx| rollback(ctx).boxed()));
        self
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    /// Starts the forward action.
    pub(crate) fn execute(&self, ctx: Arc<WorkflowContext>) -> BoxFuture<'static, Result<Value, StepError>> {
        (self.execute)(ctx)
    }

    pub(crate) fn rollback(&self) -> Option<RollbackFn> {
        self.rollback.clone()
    }
}

impl fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHandler")
            .field("rollback", &self.has_rollback())
            .finish()
    }
}

/// A validated workflow: layout plus a handler for every step.
pub struct WorkflowDefinition {
    layout: WorkflowLayout,
    handlers: HashMap<String, StepHandler>,
    on_complete: CompleteFn,
    on_error: Option<ErrorFn>,
}

impl WorkflowDefinition {
    /// Starts building a definition with the given name.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(WorkflowLayout::new(name))
    }

    /// Starts building a definition from a parsed layout.
    pub fn from_layout(layout: WorkflowLayout) -> WorkflowBuilder {
        WorkflowBuilder::new(layout)
    }

    pub fn name(&self) -> &str {
        &self.layout.name
    }

    pub fn layout(&self) -> &WorkflowLayout {
        &self.layout
    }

    pub fn groups(&self) -> &[StepGroup] {
        &self.layout.step_groups
    }

    /// Looks up the handler bound to a step.
    pub fn handler(&self, step: &str) -> Option<&StepHandler> {
        self.handlers.get(step)
    }

    pub(crate) fn on_complete(&self) -> &CompleteFn {
        &self.on_complete
    }

    pub(crate) fn on_error(&self) -> Option<&ErrorFn> {
        self.on_error.as_ref()
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("layout", &self.layout)
            .field("handlers", &self.handlers.len())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Builder for [`WorkflowDefinition`].
pub struct WorkflowBuilder {
    layout: WorkflowLayout,
    handlers: HashMap<String, StepHandler>,
    duplicate_handlers: Vec<String>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
}

impl WorkflowBuilder {
    fn new(layout: WorkflowLayout) -> Self {
        Self {
            layout,
            handlers: HashMap::new(),
            duplicate_handlers: Vec::new(),
            on_complete: None,
            on_error: None,
        }
    }

    /// Appends a group.
    pub fn group(mut self, group: StepGroup) -> Self {
        self.layout.step_groups.push(group);
        self
    }

    /// Appends a sequential group.
    pub fn sequential<I, S>(self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group(StepGroup::sequential(steps))
    }

    /// Appends a parallel group.
    pub fn parallel<I, S>(self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group(StepGroup::parallel(steps))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.layout.description = Some(description.into());
        self
    }

    /// Binds a handler to a step name.
    pub fn step(mut self, name: impl Into<String>, handler: StepHandler) -> Self {
        let name = name.into().trim().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            self.duplicate_handlers.push(name);
        }
        self
    }

    /// Sets the completion hook. Without one, the result is the step
    /// results as a JSON object.
    pub fn on_complete<F, Fut>(mut self, on_complete: F) -> Self
    where
        F: Fn(Arc<Value>, FlowMeta, StepResults) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.on_complete = Some(Arc::new(move |data, meta, results| {
            on_complete(data, meta, results).boxed()
        }));
        self
    }

    /// Sets the hook run after rollback, before the error is returned.
    pub fn on_error<F, Fut>(mut self, on_error: F) -> Self
    where
        F: Fn(Arc<Value>, FlowMeta, FlowError, StepResults) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |data, meta, error, results| {
            on_error(data, meta, error, results).boxed()
        }));
        self
    }

    /// Validates the layout against the bound handlers.
    pub fn build(self) -> Result<WorkflowDefinition, FlowError> {
        validate_definition(&self.layout, &self.handlers, &self.duplicate_handlers)?;

        let on_complete = match self.on_complete {
            Some(on_complete) => on_complete,
            None => {
                let default: CompleteFn = Arc::new(results_as_value);
                default
            }
        };

        Ok(WorkflowDefinition {
            layout: self.layout,
            handlers: self.handlers,
            on_complete,
            on_error: self.on_error,
        })
    }
}

fn results_as_value(
    _data: Arc<Value>,
    _meta: FlowMeta,
    results: StepResults,
) -> BoxFuture<'static, Result<Value, StepError>> {
    async move { Ok(results.to_value()) }.boxed()
}

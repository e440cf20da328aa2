//! Workflow Execution Engine
//!
//! Walks a definition's step groups in order:
//! - Sequential groups run one step at a time
//! - Parallel groups start every step together and wait for all of them
//!   to settle before moving on
//! - Every success is appended to the execution record and its output
//!   becomes visible to later steps
//! - The first failure stops the walk and hands the record to the
//!   [`RollbackCoordinator`]

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use crate::error::FlowError;
use crate::monitoring::{EventType, ExecutionTimeline, FlowLogger};
use crate::workflow::{
    FlowMeta, FlowState, GroupMode, StepResults, StepState, WorkflowContext, WorkflowDefinition,
};

use super::rollback::{ExecutionRecord, RollbackCoordinator, RollbackReport};
use super::step::{execute_step, StepOutcome};

/// Everything one execution produced.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Execution id
    pub flow_id: String,
    /// Completion value or the step-attributed error
    pub result: Result<Value, FlowError>,
    /// Execution and compensation events, in order
    pub timeline: ExecutionTimeline,
    /// Final lifecycle state of every step
    pub state: FlowState,
    /// Present when a step failed and rollback ran
    pub rollback: Option<RollbackReport>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::execution::Engine;
/// use flowrunner::workflow::{StepHandler, WorkflowDefinition};
/// use flowrunner::StepError;
/// use serde_json::json;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let definition = WorkflowDefinition::builder("greet")
///     .sequential(["hello"])
///     .step("hello", StepHandler::new(|_ctx| async move {
///         Ok::<_, StepError>(json!("hi"))
///     }))
///     .build()?;
///
/// let engine = Engine::new(definition);
/// let result = engine.execute(json!({})).await?;
/// assert_eq!(result, json!({ "hello": "hi" }));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Engine {
    definition: Arc<WorkflowDefinition>,
}

impl Engine {
    /// Creates a new execution engine for a workflow.
    pub fn new(definition: impl Into<Arc<WorkflowDefinition>>) -> Self {
        Self {
            definition: definition.into(),
        }
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Executes the workflow under a freshly generated flow id.
    pub async fn execute(&self, input: Value) -> Result<Value, FlowError> {
        let meta = FlowMeta::new(self.definition.name());
        self.execute_with_meta(input, meta).await
    }

    /// Executes the workflow with caller-supplied metadata.
    pub async fn execute_with_meta(&self, input: Value, meta: FlowMeta) -> Result<Value, FlowError> {
        self.execute_with_timeline(input, meta).await.result
    }

    /// Executes the workflow and returns the full execution report.
    pub async fn execute_with_timeline(&self, input: Value, meta: FlowMeta) -> ExecutionReport {
        run_workflow(&self.definition, input, meta).await
    }
}

/// Executes a workflow in-process.
///
/// Fails with [`FlowError::Step`] on the first step failure, after every
/// completed step has been compensated.
pub async fn execute_workflow(
    definition: &WorkflowDefinition,
    input: Value,
) -> Result<Value, FlowError> {
    let meta = FlowMeta::new(definition.name());
    run_workflow(definition, input, meta).await.result
}

async fn run_workflow(definition: &WorkflowDefinition, input: Value, meta: FlowMeta) -> ExecutionReport {
    let mut run = FlowRun::new(definition, input, meta);

    run.logger.info(format!(
        "starting ({} groups, {} steps)",
        definition.groups().len(),
        definition.layout().step_count()
    ));

    for (index, group) in definition.groups().iter().enumerate() {
        run.logger
            .debug(format!("group {} ({}): {:?}", index, group.mode, group.steps));

        let outcome = match group.mode {
            GroupMode::Sequential => run.run_sequential(&group.steps).await,
            GroupMode::Parallel => run.run_parallel(&group.steps).await,
        };

        if let Err(error) = outcome {
            return run.roll_back(error).await;
        }
    }

    run.complete().await
}

/// Mutable bookkeeping of one execution. Owned by a single run, never
/// shared.
struct FlowRun<'d> {
    definition: &'d WorkflowDefinition,
    meta: FlowMeta,
    data: Arc<Value>,
    logger: FlowLogger,
    results: StepResults,
    record: ExecutionRecord,
    timeline: ExecutionTimeline,
    state: FlowState,
}

impl<'d> FlowRun<'d> {
    fn new(definition: &'d WorkflowDefinition, input: Value, meta: FlowMeta) -> Self {
        let state = FlowState::new(&meta.flow_id, definition.layout());
        Self {
            definition,
            logger: meta.logger(),
            meta,
            data: Arc::new(input),
            results: StepResults::default(),
            record: ExecutionRecord::new(),
            timeline: ExecutionTimeline::new(),
            state,
        }
    }

    /// Freezes the current results into a context for handlers.
    fn snapshot(&self) -> Arc<WorkflowContext> {
        Arc::new(WorkflowContext::new(
            self.meta.clone(),
            self.data.clone(),
            self.results.clone(),
            self.logger.clone(),
        ))
    }

    async fn run_sequential(&mut self, steps: &[String]) -> Result<(), FlowError> {
        for name in steps {
            let ctx = self.snapshot();
            let outcome = self.start(name, &ctx)?.await;
            self.settle(outcome)?;
        }
        Ok(())
    }

    async fn run_parallel(&mut self, steps: &[String]) -> Result<(), FlowError> {
        // Siblings share one snapshot and never see each other's output
        let ctx = self.snapshot();
        let mut first_error: Option<FlowError> = None;
        let mut running = FuturesUnordered::new();

        for name in steps {
            match self.start(name, &ctx) {
                Ok(pending) => running.push(pending),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        // Settle in completion order, even after a sibling has failed
        while let Some(outcome) = running.next().await {
            if let Err(e) = self.settle(outcome) {
                match first_error {
                    None => first_error = Some(e),
                    Some(_) => self.logger.warn(format!("sibling also failed: {}", e)),
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Marks a step as executing and spawns its handler.
    fn start(
        &mut self,
        name: &str,
        ctx: &Arc<WorkflowContext>,
    ) -> Result<impl Future<Output = StepOutcome> + Send + 'static, FlowError> {
        let definition = self.definition;
        let handler = definition.handler(name).ok_or_else(|| {
            FlowError::step(name, format!("no handler bound to step '{}'", name).into())
        })?;

        self.timeline.add_event(name, EventType::Started);
        self.transition(name, StepState::Executing);

        Ok(execute_step(name, handler, ctx.scoped("step", name)))
    }

    /// Records a settled step. Returns the step-attributed error on failure.
    fn settle(&mut self, outcome: StepOutcome) -> Result<(), FlowError> {
        let StepOutcome { name, result } = outcome;

        match result {
            Ok(value) => {
                let rollback = self.definition.handler(&name).and_then(|h| h.rollback());
                self.record.record(name.as_str(), rollback);
                self.results.insert(name.as_str(), value);
                self.timeline.add_event(name.as_str(), EventType::Completed);
                self.transition(&name, StepState::Completed);
                Ok(())
            }
            Err(cause) => {
                self.timeline.add_event(name.as_str(), EventType::Failed);
                self.transition(&name, StepState::Failed);
                Err(FlowError::step(name, cause))
            }
        }
    }

    fn transition(&mut self, step: &str, next: StepState) {
        if let Err(e) = self.state.transition(step, next) {
            self.logger.warn(e);
        }
    }

    /// Compensates everything recorded so far and produces the failure report.
    async fn roll_back(self, error: FlowError) -> ExecutionReport {
        // Context as it stood at failure time, partial results included
        let ctx = self.snapshot();
        let FlowRun {
            definition,
            meta,
            record,
            mut timeline,
            mut state,
            ..
        } = self;

        let coordinator =
            RollbackCoordinator::new(ctx, definition.on_error(), &mut timeline, &mut state);
        let (error, report) = coordinator.run(record, error).await;

        ExecutionReport {
            flow_id: meta.flow_id,
            result: Err(error),
            timeline,
            state,
            rollback: Some(report),
        }
    }

    /// Runs the completion hook. Its failure is not rolled back.
    async fn complete(self) -> ExecutionReport {
        let on_complete = self.definition.on_complete();
        let result = on_complete(self.data.clone(), self.meta.clone(), self.results.clone())
            .await
            .map_err(|cause| FlowError::Completion {
                cause: Arc::from(cause),
            });

        match &result {
            Ok(_) => self.logger.info(format!(
                "completed in {:.2?}",
                self.timeline.elapsed()
            )),
            Err(e) => self.logger.error(e),
        }

        ExecutionReport {
            flow_id: self.meta.flow_id,
            result,
            timeline: self.timeline,
            state: self.state,
            rollback: None,
        }
    }
}

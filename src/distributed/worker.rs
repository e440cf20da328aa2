//! Queue Worker
//!
//! The remote half of distributed execution. A [`FlowWorker`] consumes the
//! topic of every workflow in its [`WorkflowRegistry`], runs each job on
//! the in-process [`Engine`] and publishes a [`JobEvent`] with the outcome.
//!
//! The job id doubles as the flow id, so log lines on both sides of the
//! queue carry the same `flow_id`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::error::{FlowError, QueueError};
use crate::execution::Engine;
use crate::workflow::{FlowMeta, WorkflowDefinition};

use super::queue::{InMemoryQueue, Job, JobEvent};

/// Payload carried by a distributed job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowJob {
    /// Workflow to run, resolved through the worker's registry
    pub workflow: String,
    /// Input data of the execution
    pub input: Value,
    /// Propagation metadata from the submitting side
    pub meta: FlowMeta,
}

/// Workflow definitions known to a worker, by name.
#[derive(Debug, Default, Clone)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition, replacing any previous one with the same name.
    pub fn register(&mut self, definition: impl Into<Arc<WorkflowDefinition>>) -> &mut Self {
        let definition = definition.into();
        self.definitions
            .insert(definition.name().to_string(), definition);
        self
    }

    pub fn with(mut self, definition: impl Into<Arc<WorkflowDefinition>>) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// Registered workflow names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Runs one job and produces the event to publish for it.
pub async fn run_job(registry: &WorkflowRegistry, job: &Job) -> JobEvent {
    match execute_job(registry, job).await {
        Ok(payload) => JobEvent::Completed {
            job_id: job.id.clone(),
            payload,
        },
        Err(e) => JobEvent::Failed {
            job_id: job.id.clone(),
            reason: e.to_string(),
        },
    }
}

async fn execute_job(registry: &WorkflowRegistry, job: &Job) -> Result<String, FlowError> {
    let flow_job: FlowJob = serde_json::from_value(job.payload.clone())?;

    let definition = registry
        .get(&flow_job.workflow)
        .ok_or_else(|| FlowError::UnknownWorkflow(flow_job.workflow.clone()))?;

    let meta = FlowMeta {
        flow_id: job.id.clone(),
        ..flow_job.meta
    };

    let result = Engine::new(definition)
        .execute_with_meta(flow_job.input, meta)
        .await?;

    Ok(serde_json::to_string(&result)?)
}

/// Consumes workflow topics from an [`InMemoryQueue`].
pub struct FlowWorker {
    queue: Arc<InMemoryQueue>,
    registry: Arc<WorkflowRegistry>,
    config: WorkerConfig,
}

impl FlowWorker {
    pub fn new(queue: Arc<InMemoryQueue>, registry: WorkflowRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Attaches to the topic of every registered workflow and starts
    /// consuming. At most `concurrency` jobs run at once across topics.
    pub fn start(&self) -> Result<WorkerHandle, QueueError> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = Vec::new();

        for name in self.registry.names() {
            let topic = self.config.topic_for(name);
            let jobs = match self.queue.take_jobs(&topic) {
                Ok(jobs) => jobs,
                Err(e) => {
                    tasks.iter().for_each(JoinHandle::abort);
                    return Err(e);
                }
            };

            log::info!("[topic={}] worker attached", topic);
            tasks.push(tokio::spawn(consume(
                jobs,
                self.queue.clone(),
                self.registry.clone(),
                permits.clone(),
            )));
        }

        Ok(WorkerHandle { tasks })
    }
}

async fn consume(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    queue: Arc<InMemoryQueue>,
    registry: Arc<WorkflowRegistry>,
    permits: Arc<Semaphore>,
) {
    while let Some(job) = jobs.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let queue = queue.clone();
        let registry = registry.clone();

        tokio::spawn(async move {
            log::debug!("[topic={} job_id={}] picked up", job.topic, job.id);
            let event = run_job(&registry, &job).await;
            queue.publish(&job.topic, event);
            drop(permit);
        });
    }
}

/// Running consumer tasks of a [`FlowWorker`].
#[derive(Debug)]
pub struct WorkerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Number of topics being consumed.
    pub fn topics(&self) -> usize {
        self.tasks.len()
    }

    /// Stops consuming. Jobs already running finish and publish normally.
    pub fn stop(&self) {
        self.tasks.iter().for_each(JoinHandle::abort);
    }

    /// Waits until every consumed topic has been closed.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::queue::{JobQueue, SubmitOptions};
    use crate::error::StepError;
    use crate::workflow::StepHandler;
    use serde_json::json;

    fn echo_definition() -> WorkflowDefinition {
        WorkflowDefinition::builder("echo")
            .sequential(["echo"])
            .step(
                "echo",
                StepHandler::new(|ctx| async move {
                    Ok::<Value, StepError>(json!({
                        "flow_id": ctx.flow_id(),
                        "input": ctx.data().clone(),
                        "tenant": ctx.meta().fields.get("tenant").cloned(),
                    }))
                }),
            )
            .build()
            .unwrap()
    }

    fn failing_definition() -> WorkflowDefinition {
        WorkflowDefinition::builder("broken")
            .sequential(["explode"])
            .step(
                "explode",
                StepHandler::new(|_ctx| async move { Err::<Value, StepError>("kaboom".into()) }),
            )
            .build()
            .unwrap()
    }

    fn job(id: &str, workflow: &str, input: Value) -> Job {
        let flow_job = FlowJob {
            workflow: workflow.to_string(),
            input,
            meta: FlowMeta::with_id("submitter-id", workflow).with_field("tenant", "acme"),
        };
        Job {
            id: id.to_string(),
            topic: format!("flows.{}", workflow),
            payload: serde_json::to_value(flow_job).unwrap(),
        }
    }

    #[test]
    fn test_registry() {
        let registry = WorkflowRegistry::new()
            .with(echo_definition())
            .with(failing_definition());

        assert_eq!(registry.names(), vec!["broken", "echo"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_run_job_uses_job_id_as_flow_id() {
        let registry = WorkflowRegistry::new().with(echo_definition());

        let event = run_job(&registry, &job("job-1", "echo", json!(5))).await;

        let (job_id, payload) = match event {
            JobEvent::Completed { job_id, payload } => (job_id, payload),
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(job_id, "job-1");
        let result: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            result,
            json!({ "echo": { "flow_id": "job-1", "input": 5, "tenant": "acme" } })
        );
    }

    #[tokio::test]
    async fn test_run_job_reports_step_failure() {
        let registry = WorkflowRegistry::new().with(failing_definition());

        let event = run_job(&registry, &job("job-2", "broken", Value::Null)).await;

        assert_eq!(
            event,
            JobEvent::Failed {
                job_id: "job-2".into(),
                reason: "step 'explode' failed: kaboom".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_run_job_unknown_workflow() {
        let registry = WorkflowRegistry::new();
        let event = run_job(&registry, &job("job-3", "ghost", Value::Null)).await;

        assert_eq!(
            event,
            JobEvent::Failed {
                job_id: "job-3".into(),
                reason: "unknown workflow 'ghost'".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_run_job_bad_payload() {
        let registry = WorkflowRegistry::new();
        let bad = Job {
            id: "job-4".into(),
            topic: "flows.echo".into(),
            payload: json!("not a flow job"),
        };

        let JobEvent::Failed { reason, .. } = run_job(&registry, &bad).await else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("payload error"));
    }

    #[tokio::test]
    async fn test_worker_consumes_and_publishes() {
        let queue = Arc::new(InMemoryQueue::new());
        let worker = FlowWorker::new(
            queue.clone(),
            WorkflowRegistry::new().with(echo_definition()),
            WorkerConfig::default(),
        );
        let handle = worker.start().unwrap();
        assert_eq!(handle.topics(), 1);

        let mut events = queue.subscribe("flows.echo");
        let payload = job("job-5", "echo", json!("hi")).payload;
        queue
            .submit("flows.echo", payload, SubmitOptions::with_job_id("job-5"))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id(), "job-5");
        assert!(matches!(event, JobEvent::Completed { .. }));

        handle.stop();
    }

    #[tokio::test]
    async fn test_second_worker_cannot_attach() {
        let queue = Arc::new(InMemoryQueue::new());
        let registry = WorkflowRegistry::new().with(echo_definition());

        let first = FlowWorker::new(queue.clone(), registry.clone(), WorkerConfig::default());
        let second = FlowWorker::new(queue, registry, WorkerConfig::default());

        let _handle = first.start().unwrap();
        assert!(second.start().is_err());
    }
}

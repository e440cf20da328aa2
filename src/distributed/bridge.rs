//! Distributed Execution Bridge
//!
//! Submits a workflow to a job queue and hands back a [`FlowHandle`]
//! straight away. The sequence per request is:
//!
//! 1. Generate the correlation id locally; it is also the job id
//! 2. Make sure the topic's completion events feed the tracker
//! 3. Register the pending completion and map the job id to it
//! 4. Submit the job under that id
//!
//! Registration happens before submission, so a worker that finishes
//! while `submit` is still in flight cannot lose its result.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::config::BridgeConfig;
use crate::error::FlowError;
use crate::workflow::{FlowMeta, WorkflowDefinition};

use super::handle::FlowHandle;
use super::queue::{JobQueue, SubmitOptions};
use super::tracker::CompletionTracker;
use super::worker::FlowJob;

/// Runs workflows on remote workers through a [`JobQueue`].
pub struct DistributedExecutor {
    queue: Arc<dyn JobQueue>,
    tracker: CompletionTracker,
    config: BridgeConfig,
    subscribing: Mutex<()>,
}

impl std::fmt::Debug for DistributedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedExecutor")
            .field("tracker", &self.tracker)
            .field("config", &self.config)
            .finish()
    }
}

impl DistributedExecutor {
    pub fn new(queue: Arc<dyn JobQueue>, tracker: CompletionTracker, config: BridgeConfig) -> Self {
        Self {
            queue,
            tracker,
            config,
            subscribing: Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Submits a workflow for remote execution.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<FlowHandle, FlowError> {
        let meta = FlowMeta::new(definition.name());
        self.execute_with_meta(definition, input, meta).await
    }

    /// Submits a workflow under caller-supplied metadata. `meta.flow_id`
    /// becomes the correlation id and the job id.
    pub async fn execute_with_meta(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
        meta: FlowMeta,
    ) -> Result<FlowHandle, FlowError> {
        let id = meta.flow_id.clone();
        let topic = self.config.topic_for(definition.name());
        let logger = meta.logger().child("topic", &topic);

        let payload = serde_json::to_value(FlowJob {
            workflow: definition.name().to_string(),
            input,
            meta,
        })?;

        self.ensure_listening(&topic);
        let rx = self
            .tracker
            .register_channel(&topic, &id, self.config.result_timeout);
        self.tracker.map_job_id(&topic, &id, &id);

        match self
            .queue
            .submit(&topic, payload, SubmitOptions::with_job_id(&id))
            .await
        {
            Ok(job_id) if job_id != id => {
                logger.warn(format!("queue assigned job id '{}' instead", job_id));
                self.tracker.map_job_id(&topic, &job_id, &id);
            }
            Ok(_) => logger.debug("submitted"),
            Err(e) => {
                self.tracker.forget(&topic, &id);
                logger.error(format!("submission failed: {}", e));
                return Err(e.into());
            }
        }

        Ok(FlowHandle::new(id, rx))
    }

    fn ensure_listening(&self, topic: &str) {
        let _guard = self
            .subscribing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.tracker.is_listening(topic) {
            self.tracker.listen(topic, self.queue.subscribe(topic));
        }
    }

    /// Stops the tracker, rejecting every outstanding handle.
    pub fn stop(&self) {
        self.tracker.stop();
    }
}

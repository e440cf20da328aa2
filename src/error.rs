//! Error Types
//!
//! Every failure a caller can observe is a [`FlowError`]. The in-process
//! engine and the distributed bridge share it, so both execution modes
//! present one failure channel.
//!
//! Compensation failures ([`RollbackError`]) and undecodable completion
//! payloads ([`CorrelationDecodeError`]) are contained where they happen and
//! only ever logged.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::workflow::validator::ValidationError;

/// Error type returned by step, rollback and completion handlers.
pub type StepError = Box<dyn Error + Send + Sync>;

/// Shared form of a handler error, cheap to clone into callbacks.
pub type SharedCause = Arc<dyn Error + Send + Sync>;

/// Errors surfaced by workflow execution.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// A step handler failed. Always carries the failing step's name.
    #[error("step '{step}' failed: {cause}")]
    Step {
        step: String,
        #[source]
        cause: SharedCause,
    },

    /// The completion handler failed after every step succeeded.
    #[error("completion handler failed: {cause}")]
    Completion {
        #[source]
        cause: SharedCause,
    },

    /// A distributed execution failed on the remote worker.
    #[error("{reason}")]
    Remote { reason: String },

    /// No completion arrived within the configured window.
    #[error("timed out after {after:?} waiting for '{correlation_id}'")]
    Timeout {
        correlation_id: String,
        after: Duration,
    },

    /// The completion tracker stopped while the call was outstanding.
    #[error("completion tracker stopped before '{correlation_id}' settled")]
    Shutdown { correlation_id: String },

    /// The workflow definition failed build-time validation.
    #[error("invalid workflow definition: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// The job queue rejected or lost a submission.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// A worker received a job for a workflow it does not know.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// A job payload or result could not be (de)serialized.
    #[error("payload error: {0}")]
    Payload(String),
}

impl FlowError {
    /// Wraps a handler error with the name of the step that raised it.
    pub fn step(step: impl Into<String>, cause: StepError) -> Self {
        Self::Step {
            step: step.into(),
            cause: Arc::from(cause),
        }
    }

    /// Name of the failing step, when the error is step-attributed.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Returns true for the errors raised by the completion tracker itself
    /// rather than by the remote execution.
    pub fn is_tracker_error(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Shutdown { .. })
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Payload(e.to_string())
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A compensation handler failed. Never leaves the rollback coordinator.
#[derive(Debug, Clone, Error)]
#[error("rollback of step '{step}' failed: {cause}")]
pub struct RollbackError {
    pub step: String,
    #[source]
    pub cause: SharedCause,
}

/// A completion payload was not valid JSON. The raw text is delivered
/// instead.
#[derive(Debug, Clone, Error)]
#[error("could not decode completion payload for job '{job_id}': {message}")]
pub struct CorrelationDecodeError {
    pub job_id: String,
    pub message: String,
}

/// Failures reported by a job queue collaborator.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("topic '{0}' is closed")]
    Closed(String),

    #[error("no worker is consuming topic '{0}'")]
    NoWorker(String),

    #[error("{0}")]
    Backend(String),
}

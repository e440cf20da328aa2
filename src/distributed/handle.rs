//! Flow Handle
//!
//! Returned immediately by a distributed execution request. The result is
//! delivered later through the completion tracker.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::FlowError;

/// Reference to a submitted distributed execution.
#[derive(Debug)]
pub struct FlowHandle {
    id: String,
    rx: oneshot::Receiver<Result<Value, FlowError>>,
}

impl FlowHandle {
    pub(crate) fn new(id: impl Into<String>, rx: oneshot::Receiver<Result<Value, FlowError>>) -> Self {
        Self { id: id.into(), rx }
    }

    /// Correlation id, also the queue job id and the remote flow id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the execution to finish.
    ///
    /// Remote step failures, timeouts and tracker shutdown all surface as
    /// the error of this call.
    pub async fn result(self) -> Result<Value, FlowError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FlowError::Shutdown {
                correlation_id: self.id,
            }),
        }
    }

    /// Waits for the execution and deserializes its result.
    pub async fn result_as<T: DeserializeOwned>(self) -> Result<T, FlowError> {
        let value = self.result().await?;
        Ok(serde_json::from_value(value)?)
    }
}

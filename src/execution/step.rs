//! Individual Step Execution
//!
//! Runs one forward or compensating handler on its own task. A panicking
//! handler is reported as an ordinary failure instead of tearing down the
//! engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinError;

use crate::error::StepError;
use crate::workflow::model::{RollbackFn, StepHandler};
use crate::workflow::WorkflowContext;

/// Result of one forward step.
#[derive(Debug)]
pub(crate) struct StepOutcome {
    pub name: String,
    pub result: Result<Value, StepError>,
}

/// Starts a step's forward action immediately on a new task.
///
/// The returned future resolves once the handler settles. Because the task
/// is spawned before the future is first polled, calling this for every
/// sibling of a parallel group starts them all at once.
pub(crate) fn execute_step(
    name: &str,
    handler: &StepHandler,
    ctx: Arc<WorkflowContext>,
) -> impl Future<Output = StepOutcome> + Send + 'static {
    let name = name.to_string();
    let logger = ctx.logger().clone();
    let task = tokio::spawn(handler.execute(ctx));
    let started = Instant::now();

    logger.debug("executing");

    async move {
        let result = task.await.unwrap_or_else(|e| Err(join_failure(e)));

        match &result {
            Ok(_) => logger.info(format!("completed in {:.2?}", started.elapsed())),
            Err(e) => logger.error(format!("failed after {:.2?}: {}", started.elapsed(), e)),
        }

        StepOutcome { name, result }
    }
}

/// Runs a step's compensating action to completion.
pub(crate) async fn compensate_step(
    rollback: &RollbackFn,
    ctx: Arc<WorkflowContext>,
) -> Result<(), StepError> {
    let logger = ctx.logger().clone();
    let started = Instant::now();

    logger.debug("compensating");

    let result = tokio::spawn(rollback(ctx))
        .await
        .unwrap_or_else(|e| Err(join_failure(e)));

    if result.is_ok() {
        logger.info(format!("compensated in {:.2?}", started.elapsed()));
    }

    result
}

fn join_failure(e: JoinError) -> StepError {
    if e.is_panic() {
        "handler panicked".into()
    } else {
        Box::new(e)
    }
}

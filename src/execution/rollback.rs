//! Rollback Coordination
//!
//! The [`ExecutionRecord`] lists successful steps in the order they
//! actually completed. On failure the [`RollbackCoordinator`] walks it
//! backwards and runs each compensation. A compensation that fails is
//! logged and recorded, and the walk continues with the next entry.

use std::sync::Arc;

use crate::error::{FlowError, RollbackError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::model::{ErrorFn, RollbackFn};
use crate::workflow::{FlowState, StepState, WorkflowContext};

use super::step::compensate_step;

/// One successful step.
#[derive(Clone)]
struct RecordEntry {
    step: String,
    rollback: Option<RollbackFn>,
}

/// Successful steps of one execution, in completion order.
#[derive(Clone, Default)]
pub struct ExecutionRecord {
    entries: Vec<RecordEntry>,
}

impl ExecutionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step that just succeeded.
    pub fn record(&mut self, step: impl Into<String>, rollback: Option<RollbackFn>) {
        self.entries.push(RecordEntry {
            step: step.into(),
            rollback,
        });
    }

    /// Step names in completion order.
    pub fn completion_order(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.step.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ExecutionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.completion_order()).finish()
    }
}

/// What a rollback pass did.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    /// Steps compensated successfully, in the order they were compensated
    pub rolled_back: Vec<String>,
    /// Steps without a compensation
    pub skipped: Vec<String>,
    /// Compensations that failed
    pub failures: Vec<RollbackError>,
}

impl RollbackReport {
    /// Returns true if every compensation that ran succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Compensates completed steps after a failure.
pub struct RollbackCoordinator<'a> {
    ctx: Arc<WorkflowContext>,
    on_error: Option<&'a ErrorFn>,
    timeline: &'a mut ExecutionTimeline,
    state: &'a mut FlowState,
}

impl<'a> RollbackCoordinator<'a> {
    /// `ctx` is the context as it stood at failure time.
    pub fn new(
        ctx: Arc<WorkflowContext>,
        on_error: Option<&'a ErrorFn>,
        timeline: &'a mut ExecutionTimeline,
        state: &'a mut FlowState,
    ) -> Self {
        Self {
            ctx,
            on_error,
            timeline,
            state,
        }
    }

    /// Rolls back `record` in reverse completion order, then runs the
    /// error hook. Returns the error to hand back to the caller.
    pub async fn run(self, record: ExecutionRecord, error: FlowError) -> (FlowError, RollbackReport) {
        let logger = self.ctx.logger().child("phase", "rollback");
        let mut report = RollbackReport::default();

        logger.warn(format!(
            "{}; compensating {} completed step(s)",
            error,
            record.len()
        ));

        for entry in record.entries.into_iter().rev() {
            let Some(rollback) = entry.rollback else {
                logger.debug(format!("step '{}' has no compensation", entry.step));
                report.skipped.push(entry.step);
                continue;
            };

            let ctx = self.ctx.scoped("step", &entry.step);

            match compensate_step(&rollback, ctx).await {
                Ok(()) => {
                    self.timeline.add_event(&entry.step, EventType::RolledBack);
                    if let Err(e) = self.state.transition(&entry.step, StepState::RolledBack) {
                        logger.warn(e);
                    }
                    report.rolled_back.push(entry.step);
                }
                Err(cause) => {
                    let failure = RollbackError {
                        step: entry.step.clone(),
                        cause: Arc::from(cause),
                    };
                    logger.warn(&failure);
                    self.timeline.add_event(&entry.step, EventType::RollbackFailed);
                    report.failures.push(failure);
                }
            }
        }

        if let Some(on_error) = self.on_error {
            let ctx = &self.ctx;
            on_error(
                ctx.shared_data(),
                ctx.meta().clone(),
                error.clone(),
                ctx.results().clone(),
            )
            .await;
        }

        logger.info(format!(
            "rollback finished: {} compensated, {} skipped, {} failed",
            report.rolled_back.len(),
            report.skipped.len(),
            report.failures.len()
        ));

        (error, report)
    }
}

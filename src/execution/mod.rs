//! Workflow Execution Module
//!
//! Provides the in-process execution engine: group scheduling, per-step
//! task isolation and compensation of completed steps after a failure.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine walking the step groups
//! - [`step`]: Individual step execution logic
//! - [`rollback`]: Execution record and reverse-order compensation

pub mod engine;
pub mod rollback;
pub mod step;

pub use engine::{execute_workflow, Engine, ExecutionReport};
pub use rollback::{ExecutionRecord, RollbackCoordinator, RollbackReport};

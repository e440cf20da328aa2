//! FlowRunner - Saga Workflow Orchestration Engine
//!
//! Runs multi-step business workflows as sagas: every step has a forward
//! action and an optional compensation, and when a step fails the steps
//! that already succeeded are compensated in reverse completion order.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Step groups, handlers, definitions and execution context
//! - [`execution`]: In-process engine and rollback coordination
//! - [`distributed`]: Queue bridge, completion tracker and worker
//! - [`monitoring`]: Flow-scoped logging and execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::workflow::{StepHandler, WorkflowDefinition};
//! use flowrunner::{execute_workflow, StepError};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = WorkflowDefinition::builder("place_order")
//!     .sequential(["charge", "ship"])
//!     .step(
//!         "charge",
//!         StepHandler::new(|ctx| async move {
//!             Ok::<_, StepError>(json!({ "amount": ctx.data()["amount"] }))
//!         })
//!         .with_rollback(|_ctx| async move { Ok::<_, StepError>(()) }),
//!     )
//!     .step(
//!         "ship",
//!         StepHandler::new(|_ctx| async move { Ok::<_, StepError>(json!("shipped")) }),
//!     )
//!     .build()?;
//!
//! let result = execute_workflow(&definition, json!({ "amount": 30 })).await?;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod distributed;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::RunnerConfig;
pub use distributed::{CompletionTracker, DistributedExecutor, FlowHandle};
pub use error::{FlowError, StepError};
pub use execution::{execute_workflow, Engine};
pub use workflow::{StepHandler, WorkflowContext, WorkflowDefinition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

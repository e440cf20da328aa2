//! Workflow Definition Module
//!
//! Provides the data structures describing a saga and the per-execution
//! values handed to its handlers.
//!
//! # Structure
//!
//! - [`model`]: Step groups, handlers and the validated definition
//! - [`context`]: Immutable per-execution context and step results
//! - [`parser`]: YAML layout loading
//! - [`validator`]: Build-time validation rules
//! - [`state`]: Per-step lifecycle state machine

pub mod context;
pub mod model;
pub mod parser;
pub mod state;
pub mod validator;

pub use context::{FlowMeta, StepResults, WorkflowContext};
pub use model::{
    GroupMode, StepGroup, StepHandler, WorkflowBuilder, WorkflowDefinition, WorkflowLayout,
};
pub use parser::{load_layout, parse_layout, save_layout};
pub use state::{FlowState, StepState};
pub use validator::ValidationError;

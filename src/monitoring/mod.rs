//! Monitoring Module
//!
//! Flow-scoped logging and the execution timeline recorded during
//! workflow runs.
//!
//! # Components
//!
//! - [`FlowLogger`]: Structured `[key=value]` log prefixes for one execution
//! - [`ExecutionTimeline`]: Step start/end and compensation events for Gantt charts

pub mod logger;
pub mod timeline;

pub use logger::FlowLogger;
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};

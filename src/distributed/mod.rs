//! Distributed Execution Module
//!
//! Runs workflows on remote workers through a job queue while keeping the
//! caller-facing failure contract of the in-process engine.
//!
//! # Components
//!
//! - [`bridge`]: Pre-registers, submits and returns a [`FlowHandle`]
//! - [`tracker`]: Matches completion events to waiting callers
//! - [`handle`]: Deferred access to a remote result
//! - [`queue`]: Job queue boundary and an in-memory implementation
//! - [`worker`]: Consumes workflow topics and publishes outcomes

pub mod bridge;
pub mod handle;
pub mod queue;
pub mod tracker;
pub mod worker;

pub use bridge::DistributedExecutor;
pub use handle::FlowHandle;
pub use queue::{InMemoryQueue, Job, JobEvent, JobQueue, SubmitOptions};
pub use tracker::CompletionTracker;
pub use worker::{FlowJob, FlowWorker, WorkerHandle, WorkflowRegistry};

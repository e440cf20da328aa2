//! Job Queue Boundary
//!
//! [`JobQueue`] is everything the distributed bridge needs from a queue
//! backend: submit a job under a caller-chosen id, and subscribe to the
//! completion events of a topic.
//!
//! [`InMemoryQueue`] is a non-durable implementation for embedding and
//! tests. Each topic has one job channel, consumed by a worker, and one
//! broadcast channel of [`JobEvent`]s.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::QueueError;

/// Capacity of each topic's event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Completion event published for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The job finished; `payload` is the JSON text of its result
    Completed { job_id: String, payload: String },
    /// The job failed with a human-readable reason
    Failed { job_id: String, reason: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => job_id,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Explicit job id. The backend generates one when absent.
    pub job_id: Option<String>,
}

impl SubmitOptions {
    pub fn with_job_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
        }
    }
}

/// Queue backend consumed by the distributed bridge.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits a job and returns its id.
    ///
    /// An explicit id in `options` must be honoured; resubmitting an id the
    /// queue already knows returns it without enqueueing the job again.
    async fn submit(
        &self,
        topic: &str,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<String, QueueError>;

    /// Subscribes to the completion events of a topic.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<JobEvent>;
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub topic: String,
    pub payload: Value,
}

struct TopicChannel {
    jobs: mpsc::UnboundedSender<Job>,
    /// Present until a worker takes it
    consumer: Option<mpsc::UnboundedReceiver<Job>>,
    events: broadcast::Sender<JobEvent>,
    known_ids: HashSet<String>,
    closed: bool,
}

impl TopicChannel {
    fn new() -> Self {
        let (jobs, consumer) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs,
            consumer: Some(consumer),
            events,
            known_ids: HashSet::new(),
            closed: false,
        }
    }
}

/// In-process, non-durable job queue.
#[derive(Default)]
pub struct InMemoryQueue {
    topics: Mutex<HashMap<String, TopicChannel>>,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.lock();
        let mut names: Vec<&String> = topics.keys().collect();
        names.sort();
        f.debug_struct("InMemoryQueue").field("topics", &names).finish()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicChannel>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the job stream of a topic. Each topic has a single consumer.
    pub fn take_jobs(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Job>, QueueError> {
        let mut topics = self.lock();
        let channel = topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new);

        if channel.closed {
            return Err(QueueError::Closed(topic.to_string()));
        }
        channel
            .consumer
            .take()
            .ok_or_else(|| QueueError::Backend(format!("topic '{}' already has a consumer", topic)))
    }

    /// Publishes a completion event to the topic's subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, topic: &str, event: JobEvent) -> usize {
        let mut topics = self.lock();
        let channel = topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new);
        // No subscribers is not an error: nobody is waiting
        channel.events.send(event).unwrap_or(0)
    }

    /// Stops accepting jobs on a topic. Workers see their stream end once
    /// the queued jobs are drained.
    pub fn close(&self, topic: &str) {
        let mut topics = self.lock();
        let channel = topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new);
        channel.closed = true;
        // Swap in a dead sender so the consumer observes end of stream
        let (dead, _) = mpsc::unbounded_channel();
        channel.jobs = dead;
        channel.consumer = None;
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn submit(
        &self,
        topic: &str,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<String, QueueError> {
        let mut topics = self.lock();
        let channel = topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new);

        if channel.closed {
            return Err(QueueError::Closed(topic.to_string()));
        }

        let id = options.job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if !channel.known_ids.insert(id.clone()) {
            log::debug!("[topic={}] job '{}' already submitted", topic, id);
            return Ok(id);
        }

        let job = Job {
            id: id.clone(),
            topic: topic.to_string(),
            payload,
        };
        if channel.jobs.send(job).is_err() {
            channel.known_ids.remove(&id);
            return Err(QueueError::NoWorker(topic.to_string()));
        }

        log::debug!("[topic={}] job '{}' queued", topic, id);
        Ok(id)
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<JobEvent> {
        self.lock()
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new)
            .events
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_honours_explicit_id() {
        let queue = InMemoryQueue::new();
        let mut jobs = queue.take_jobs("t").unwrap();

        let id = queue
            .submit("t", json!({ "n": 1 }), SubmitOptions::with_job_id("job-7"))
            .await
            .unwrap();

        assert_eq!(id, "job-7");
        let job = jobs.recv().await.unwrap();
        assert_eq!(job.id, "job-7");
        assert_eq!(job.topic, "t");
        assert_eq!(job.payload, json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn test_submit_generates_id() {
        let queue = InMemoryQueue::new();
        let id = queue.submit("t", Value::Null, SubmitOptions::default()).await.unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_idempotent() {
        let queue = InMemoryQueue::new();
        let mut jobs = queue.take_jobs("t").unwrap();

        for _ in 0..2 {
            queue
                .submit("t", json!(1), SubmitOptions::with_job_id("same"))
                .await
                .unwrap();
        }

        assert!(jobs.recv().await.is_some());
        assert!(jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_jobs_buffer_before_worker_attaches() {
        let queue = InMemoryQueue::new();
        queue
            .submit("t", json!("early"), SubmitOptions::with_job_id("j1"))
            .await
            .unwrap();

        let mut jobs = queue.take_jobs("t").unwrap();
        assert_eq!(jobs.recv().await.unwrap().payload, json!("early"));
    }

    #[test]
    fn test_single_consumer_per_topic() {
        let queue = InMemoryQueue::new();
        assert!(queue.take_jobs("t").is_ok());
        assert!(matches!(queue.take_jobs("t"), Err(QueueError::Backend(_))));
        assert!(queue.take_jobs("other").is_ok());
    }

    #[tokio::test]
    async fn test_dropped_consumer_means_no_worker() {
        let queue = InMemoryQueue::new();
        drop(queue.take_jobs("t").unwrap());

        let err = queue
            .submit("t", Value::Null, SubmitOptions::with_job_id("j1"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NoWorker(_)));

        // The rejected id can be retried later
        let err = queue
            .submit("t", Value::Null, SubmitOptions::with_job_id("j1"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NoWorker(_)));
    }

    #[tokio::test]
    async fn test_closed_topic_rejects_submissions() {
        let queue = InMemoryQueue::new();
        let mut jobs = queue.take_jobs("t").unwrap();
        queue.close("t");

        let err = queue.submit("t", Value::Null, SubmitOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "topic 't' is closed");
        assert!(jobs.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let queue = InMemoryQueue::new();
        let mut events = queue.subscribe("t");

        let event = JobEvent::Failed {
            job_id: "j1".into(),
            reason: "boom".into(),
        };
        assert_eq!(queue.publish("t", event.clone()), 1);
        assert_eq!(queue.publish("unwatched", event.clone()), 0);

        let received = events.recv().await.unwrap();
        assert_eq!(received, event);
        assert_eq!(received.job_id(), "j1");
    }
}

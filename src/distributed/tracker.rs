//! Completion Tracker
//!
//! Matches asynchronous completion events coming back from a job queue to
//! the callers waiting on them.
//!
//! State is kept per topic, so one topic can be torn down without touching
//! the others. Within a topic:
//!
//! - `pending` maps a correlation id to its completion callback and timeout
//! - `job_to_correlation` / `correlation_to_job` link queue job ids to
//!   correlation ids
//! - `early` buffers outcomes whose job id is not mapped yet, oldest
//!   evicted first once `early_capacity` is reached
//! - `settled` remembers recently settled job ids so duplicate deliveries
//!   are dropped
//!
//! Callbacks are always invoked after the topic lock has been released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::TrackerConfig;
use crate::error::{CorrelationDecodeError, FlowError};
use crate::monitoring::FlowLogger;

use super::queue::JobEvent;

/// Callback receiving the single outcome of a pending completion.
type Completion = Box<dyn FnOnce(Result<Value, FlowError>) + Send>;

/// Outcome received for a job.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed(Value),
    Failed(String),
}

impl Outcome {
    fn into_result(self) -> Result<Value, FlowError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(reason) => Err(FlowError::Remote { reason }),
        }
    }
}

struct Pending {
    callback: Completion,
    timeout: Option<JoinHandle<()>>,
}

impl Pending {
    fn cancel_timeout(&self) {
        if let Some(timeout) = &self.timeout {
            timeout.abort();
        }
    }
}

#[derive(Default)]
struct TopicState {
    pending: HashMap<String, Pending>,
    job_to_correlation: HashMap<String, String>,
    correlation_to_job: HashMap<String, String>,
    early: IndexMap<String, Outcome>,
    settled: VecDeque<String>,
    settled_ids: HashSet<String>,
    listener: Option<JoinHandle<()>>,
}

impl TopicState {
    /// Removes a pending entry together with its job mapping.
    fn take(&mut self, correlation_id: &str, history: usize) -> Option<Pending> {
        let pending = self.pending.remove(correlation_id)?;
        if let Some(job_id) = self.correlation_to_job.remove(correlation_id) {
            self.job_to_correlation.remove(&job_id);
            self.remember_settled(job_id, history);
        }
        Some(pending)
    }

    fn remember_settled(&mut self, job_id: String, history: usize) {
        if history == 0 || !self.settled_ids.insert(job_id.clone()) {
            return;
        }
        self.settled.push_back(job_id);
        while self.settled.len() > history {
            if let Some(oldest) = self.settled.pop_front() {
                self.settled_ids.remove(&oldest);
            }
        }
    }

    /// Buffers an outcome for an unmapped job, returning the job id evicted
    /// to stay within `capacity`.
    fn buffer_early(&mut self, job_id: &str, outcome: Outcome, capacity: usize) -> Option<String> {
        self.early.insert(job_id.to_string(), outcome);
        if self.early.len() > capacity.max(1) {
            return self.early.shift_remove_index(0).map(|(evicted, _)| evicted);
        }
        None
    }

    /// Empties the topic, returning every outstanding entry.
    fn drain(&mut self) -> Vec<(String, Pending)> {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        let drained: Vec<(String, Pending)> = self.pending.drain().collect();
        for (_, pending) in &drained {
            pending.cancel_timeout();
        }
        self.job_to_correlation.clear();
        self.correlation_to_job.clear();
        self.early.clear();
        self.settled.clear();
        self.settled_ids.clear();
        drained
    }
}

struct TrackerInner {
    topics: RwLock<HashMap<String, Arc<Mutex<TopicState>>>>,
    config: TrackerConfig,
    stopped: AtomicBool,
}

fn lock(state: &Mutex<TopicState>) -> MutexGuard<'_, TopicState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn shutdown(pending: Vec<(String, Pending)>) {
    for (correlation_id, entry) in pending {
        (entry.callback)(Err(FlowError::Shutdown { correlation_id }));
    }
}

/// Tracks outstanding distributed executions across topics.
///
/// Cheap to clone; clones share state. Registering a timeout or attaching
/// a listener spawns a task, so those calls must happen inside a tokio
/// runtime.
#[derive(Clone)]
pub struct CompletionTracker {
    inner: Arc<TrackerInner>,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("config", &self.inner.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl CompletionTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                topics: RwLock::new(HashMap::new()),
                config,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(inner: &Weak<TrackerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn topic(&self, topic: &str) -> Arc<Mutex<TopicState>> {
        if let Some(state) = self
            .inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
        {
            return state.clone();
        }

        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .clone()
    }

    fn existing_topic(&self, topic: &str) -> Option<Arc<Mutex<TopicState>>> {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    fn history(&self) -> usize {
        self.inner.config.settled_history
    }

    fn early_capacity(&self) -> usize {
        self.inner.config.early_capacity
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Registers a pending completion.
    ///
    /// Exactly one of `on_success` / `on_error` is eventually called: on
    /// completion, failure, timeout or shutdown. Registering a correlation
    /// id that is already pending rejects the earlier caller with a
    /// shutdown error. A zero timeout means none.
    pub fn register<S, E>(
        &self,
        topic: &str,
        correlation_id: &str,
        on_success: S,
        on_error: E,
        timeout: Option<Duration>,
    ) where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(FlowError) + Send + 'static,
    {
        let callback: Completion = Box::new(move |outcome| match outcome {
            Ok(value) => on_success(value),
            Err(e) => on_error(e),
        });
        self.insert(topic, correlation_id, callback, timeout);
    }

    /// Registers a pending completion delivered through a oneshot channel.
    pub fn register_channel(
        &self,
        topic: &str,
        correlation_id: &str,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<Value, FlowError>> {
        let (tx, rx) = oneshot::channel();
        let callback: Completion = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.insert(topic, correlation_id, callback, timeout);
        rx
    }

    fn insert(&self, topic: &str, correlation_id: &str, callback: Completion, timeout: Option<Duration>) {
        let rejected = || FlowError::Shutdown {
            correlation_id: correlation_id.to_string(),
        };
        if self.is_stopped() {
            callback(Err(rejected()));
            return;
        }

        let logger = FlowLogger::new()
            .child("topic", topic)
            .child("correlation_id", correlation_id);
        let state = self.topic(topic);
        let replaced = {
            let mut state = lock(&state);

            // stop() may have drained the topics between the check above
            // and this lock
            if self.is_stopped() {
                drop(state);
                callback(Err(rejected()));
                return;
            }

            let timeout = timeout.filter(|after| !after.is_zero()).map(|after| {
                let tracker = Arc::downgrade(&self.inner);
                let topic = topic.to_string();
                let correlation_id = correlation_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(tracker) = CompletionTracker::from_weak(&tracker) {
                        tracker.expire(&topic, &correlation_id, after);
                    }
                })
            });

            state
                .pending
                .insert(correlation_id.to_string(), Pending { callback, timeout })
        };
        logger.debug("registered");

        if let Some(replaced) = replaced {
            replaced.cancel_timeout();
            logger.warn("correlation id registered twice, previous caller rejected");
            (replaced.callback)(Err(rejected()));
        }
    }

    /// Links a queue job id to a correlation id, delivering any outcome
    /// that arrived for the job before the link existed.
    pub fn map_job_id(&self, topic: &str, job_id: &str, correlation_id: &str) {
        let state = self.topic(topic);
        let delivery = {
            let mut state = lock(&state);
            match state.early.shift_remove(job_id) {
                Some(outcome) => {
                    let history = self.history();
                    let pending = state.take(correlation_id, history);
                    // The job never gets a mapping, so record it here to
                    // drop later duplicates
                    state.remember_settled(job_id.to_string(), history);
                    pending.map(|pending| (pending, outcome))
                }
                None => {
                    if let Some(previous) = state
                        .correlation_to_job
                        .insert(correlation_id.to_string(), job_id.to_string())
                    {
                        if previous != job_id {
                            state.job_to_correlation.remove(&previous);
                        }
                    }
                    state
                        .job_to_correlation
                        .insert(job_id.to_string(), correlation_id.to_string());
                    None
                }
            }
        };

        if let Some((pending, outcome)) = delivery {
            FlowLogger::new()
                .child("topic", topic)
                .child("job_id", job_id)
                .debug("delivering early result");
            pending.cancel_timeout();
            (pending.callback)(outcome.into_result());
        }
    }

    /// Handles a completed event from the queue. A payload that is not
    /// valid JSON is delivered as a JSON string.
    pub fn handle_completed(&self, topic: &str, job_id: &str, payload: &str) {
        let value = serde_json::from_str(payload).unwrap_or_else(|e| {
            let failure = CorrelationDecodeError {
                job_id: job_id.to_string(),
                message: e.to_string(),
            };
            FlowLogger::new().child("topic", topic).warn(failure);
            Value::String(payload.to_string())
        });
        self.handle_outcome(topic, job_id, Outcome::Completed(value));
    }

    /// Handles a failed event from the queue.
    pub fn handle_failed(&self, topic: &str, job_id: &str, reason: &str) {
        self.handle_outcome(topic, job_id, Outcome::Failed(reason.to_string()));
    }

    fn handle_outcome(&self, topic: &str, job_id: &str, outcome: Outcome) {
        if self.is_stopped() {
            return;
        }

        let logger = FlowLogger::new().child("topic", topic).child("job_id", job_id);
        let state = self.topic(topic);
        let pending = {
            let mut state = lock(&state);

            if state.settled_ids.contains(job_id) {
                logger.debug("duplicate delivery for settled job dropped");
                return;
            }

            match state.job_to_correlation.get(job_id).cloned() {
                Some(correlation_id) => state.take(&correlation_id, self.history()),
                None => {
                    if state.early.contains_key(job_id) {
                        logger.warn("early result already buffered, later outcome dropped");
                    } else {
                        logger.debug("no mapping yet, buffering early result");
                        if let Some(evicted) = state.buffer_early(job_id, outcome, self.early_capacity()) {
                            logger.warn(format!("early buffer full, dropped result for job '{}'", evicted));
                        }
                    }
                    return;
                }
            }
        };

        if let Some(pending) = pending {
            pending.cancel_timeout();
            (pending.callback)(outcome.into_result());
        }
    }

    /// Resolves a pending entry. No-op if it already settled.
    pub fn complete(&self, topic: &str, correlation_id: &str, result: Value) {
        self.settle(topic, correlation_id, Ok(result));
    }

    /// Rejects a pending entry. No-op if it already settled.
    pub fn fail(&self, topic: &str, correlation_id: &str, error: FlowError) {
        self.settle(topic, correlation_id, Err(error));
    }

    fn settle(&self, topic: &str, correlation_id: &str, outcome: Result<Value, FlowError>) {
        let Some(state) = self.existing_topic(topic) else {
            return;
        };
        let pending = lock(&state).take(correlation_id, self.history());

        if let Some(pending) = pending {
            pending.cancel_timeout();
            (pending.callback)(outcome);
        }
    }

    fn expire(&self, topic: &str, correlation_id: &str, after: Duration) {
        let Some(state) = self.existing_topic(topic) else {
            return;
        };
        // The firing timer owns this task, so its handle is not aborted
        let pending = lock(&state).take(correlation_id, self.history());

        if let Some(pending) = pending {
            FlowLogger::new()
                .child("topic", topic)
                .child("correlation_id", correlation_id)
                .warn(format!("no completion after {:?}", after));
            (pending.callback)(Err(FlowError::Timeout {
                correlation_id: correlation_id.to_string(),
                after,
            }));
        }
    }

    /// Drops a pending entry without invoking its callback.
    ///
    /// Returns true if an entry was removed.
    pub fn forget(&self, topic: &str, correlation_id: &str) -> bool {
        let Some(state) = self.existing_topic(topic) else {
            return false;
        };
        let pending = lock(&state).take(correlation_id, self.history());

        match pending {
            Some(pending) => {
                pending.cancel_timeout();
                true
            }
            None => false,
        }
    }

    /// Feeds a queue event stream into this tracker until the stream
    /// closes or the topic is removed.
    pub fn listen(&self, topic: &str, mut events: broadcast::Receiver<JobEvent>) {
        let tracker = Arc::downgrade(&self.inner);
        let topic_name = topic.to_string();

        let task = tokio::spawn(async move {
            let logger = FlowLogger::new().child("topic", &topic_name);
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        logger.warn(format!("listener lagged, {} events missed", missed));
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(tracker) = CompletionTracker::from_weak(&tracker) else {
                    break;
                };
                match event {
                    JobEvent::Completed { job_id, payload } => {
                        tracker.handle_completed(&topic_name, &job_id, &payload)
                    }
                    JobEvent::Failed { job_id, reason } => {
                        tracker.handle_failed(&topic_name, &job_id, &reason)
                    }
                }
            }
            logger.debug("event stream closed");
        });

        let state = self.topic(topic);
        let previous = lock(&state).listener.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Returns true if a live event stream is attached to the topic.
    pub fn is_listening(&self, topic: &str) -> bool {
        self.existing_topic(topic)
            .map(|state| {
                lock(&state)
                    .listener
                    .as_ref()
                    .is_some_and(|listener| !listener.is_finished())
            })
            .unwrap_or(false)
    }

    /// Tears one topic down, rejecting its outstanding entries with a
    /// shutdown error. Other topics are untouched.
    pub fn remove_topic(&self, topic: &str) {
        let removed = self
            .inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);

        if let Some(state) = removed {
            let pending = lock(&state).drain();
            FlowLogger::new()
                .child("topic", topic)
                .info(format!("removed, {} pending rejected", pending.len()));
            shutdown(pending);
        }
    }

    /// Rejects every outstanding entry with a shutdown error and detaches
    /// all listeners. Safe to call more than once.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        let topics = std::mem::take(
            &mut *self
                .inner
                .topics
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let pending: Vec<(String, Pending)> = topics
            .values()
            .flat_map(|state| lock(state).drain())
            .collect();

        if !topics.is_empty() {
            log::info!(
                "completion tracker stopped: {} topic(s), {} pending rejected",
                topics.len(),
                pending.len()
            );
        }
        shutdown(pending);
    }

    /// Number of entries awaiting completion on a topic.
    pub fn pending_count(&self, topic: &str) -> usize {
        self.existing_topic(topic)
            .map(|state| lock(&state).pending.len())
            .unwrap_or(0)
    }

    /// Number of buffered early results on a topic.
    pub fn early_count(&self, topic: &str) -> usize {
        self.existing_topic(topic)
            .map(|state| lock(&state).early.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn recording(tracker: &CompletionTracker, topic: &str, id: &str, timeout: Option<Duration>) -> Calls {
        let calls: Calls = Arc::default();
        let ok = calls.clone();
        let err = calls.clone();
        tracker.register(
            topic,
            id,
            move |value| ok.lock().unwrap().push(format!("ok {}", value)),
            move |error| err.lock().unwrap().push(format!("err {}", error)),
            timeout,
        );
        calls
    }

    fn calls(calls: &Calls) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_round_trip_delivers_decoded_payload_once() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "flows.order", "c1", None);

        tracker.map_job_id("flows.order", "j1", "c1");
        tracker.handle_completed("flows.order", "j1", r#"{"total":12}"#);

        assert_eq!(calls(&seen), vec![r#"ok {"total":12}"#]);
        assert_eq!(tracker.pending_count("flows.order"), 0);
    }

    #[tokio::test]
    async fn test_early_result_delivered_on_mapping() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", None);

        tracker.handle_completed("t", "j1", "42");
        assert!(calls(&seen).is_empty());
        assert_eq!(tracker.early_count("t"), 1);

        tracker.map_job_id("t", "j1", "c1");

        assert_eq!(calls(&seen), vec!["ok 42"]);
        assert_eq!(tracker.early_count("t"), 0);
        assert_eq!(tracker.pending_count("t"), 0);
    }

    #[tokio::test]
    async fn test_early_failure_delivered_on_mapping() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", None);

        tracker.handle_failed("t", "j1", "step 'ship' failed: no carrier");
        tracker.map_job_id("t", "j1", "c1");

        assert_eq!(calls(&seen), vec!["err step 'ship' failed: no carrier"]);
    }

    #[tokio::test]
    async fn test_early_results_keep_first() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", None);

        tracker.handle_completed("t", "j1", "1");
        tracker.handle_completed("t", "j1", "2");
        tracker.map_job_id("t", "j1", "c1");

        assert_eq!(calls(&seen), vec!["ok 1"]);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", None);
        tracker.map_job_id("t", "j1", "c1");

        tracker.handle_completed("t", "j1", r#""first""#);
        tracker.handle_completed("t", "j1", r#""second""#);

        assert_eq!(calls(&seen), vec![r#"ok "first""#]);
        assert_eq!(tracker.early_count("t"), 0);
    }

    #[tokio::test]
    async fn test_settled_history_is_bounded() {
        let tracker = CompletionTracker::new(TrackerConfig {
            settled_history: 1,
            ..TrackerConfig::default()
        });
        for (corr, job) in [("c1", "j1"), ("c2", "j2")] {
            let _ = recording(&tracker, "t", corr, None);
            tracker.map_job_id("t", job, corr);
            tracker.handle_completed("t", job, "null");
        }

        // j1 fell out of the history; a late duplicate is buffered instead
        tracker.handle_completed("t", "j1", "null");
        tracker.handle_completed("t", "j2", "null");
        assert_eq!(tracker.early_count("t"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_after_early_delivery_is_dropped() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", None);

        tracker.handle_completed("t", "j1", r#""first""#);
        tracker.map_job_id("t", "j1", "c1");
        tracker.handle_completed("t", "j1", r#""again""#);

        assert_eq!(calls(&seen), vec![r#"ok "first""#]);
        assert_eq!(tracker.early_count("t"), 0);
    }

    #[tokio::test]
    async fn test_early_buffer_evicts_oldest() {
        let tracker = CompletionTracker::new(TrackerConfig {
            early_capacity: 2,
            ..TrackerConfig::default()
        });
        let first = recording(&tracker, "t", "c1", None);
        let last = recording(&tracker, "t", "c3", None);

        // Completions for jobs this tracker never maps
        for job in ["j1", "j2", "j3"] {
            tracker.handle_completed("t", job, "7");
        }
        assert_eq!(tracker.early_count("t"), 2);

        tracker.map_job_id("t", "j1", "c1");
        tracker.map_job_id("t", "j3", "c3");

        assert!(calls(&first).is_empty());
        assert_eq!(calls(&last), vec!["ok 7"]);
        assert_eq!(tracker.early_count("t"), 1);
    }

    #[tokio::test]
    async fn test_reregistration_rejects_previous_caller() {
        let tracker = CompletionTracker::default();
        let first = recording(&tracker, "t", "c1", None);
        let second = tracker.register_channel("t", "c1", None);

        assert_eq!(calls(&first), vec!["err completion tracker stopped before 'c1' settled"]);
        assert_eq!(tracker.pending_count("t"), 1);

        tracker.complete("t", "c1", json!("done"));
        tracker.stop();

        assert_eq!(second.await.unwrap().unwrap(), json!("done"));
        assert_eq!(calls(&first).len(), 1);
    }

    #[tokio::test]
    async fn test_remap_drops_previous_job_link() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", None);

        tracker.map_job_id("t", "j1", "c1");
        tracker.map_job_id("t", "j2", "c1");
        tracker.handle_completed("t", "j1", r#""stale""#);

        assert!(calls(&seen).is_empty());
        assert_eq!(tracker.early_count("t"), 1);

        tracker.handle_completed("t", "j2", r#""fresh""#);
        assert_eq!(calls(&seen), vec![r#"ok "fresh""#]);
    }

    #[tokio::test]
    async fn test_undecodable_payload_delivered_raw() {
        let tracker = CompletionTracker::default();
        let rx = tracker.register_channel("t", "c1", None);
        tracker.map_job_id("t", "j1", "c1");

        tracker.handle_completed("t", "j1", "not json {");

        assert_eq!(rx.await.unwrap().unwrap(), json!("not json {"));
    }

    #[tokio::test]
    async fn test_complete_and_fail_are_idempotent() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", None);

        tracker.complete("t", "c1", json!(1));
        tracker.complete("t", "c1", json!(2));
        tracker.fail("t", "c1", FlowError::Remote { reason: "late".into() });
        tracker.complete("unknown", "c1", json!(3));

        assert_eq!(calls(&seen), vec!["ok 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_removes_entry() {
        let tracker = CompletionTracker::default();
        let started = tokio::time::Instant::now();
        let rx = tracker.register_channel("t", "c1", Some(Duration::from_millis(50)));

        let err = rx.await.unwrap().unwrap_err();

        assert!(matches!(err, FlowError::Timeout { ref correlation_id, .. } if correlation_id == "c1"));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(tracker.pending_count("t"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cancels_timeout() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", Some(Duration::from_millis(50)));

        tracker.complete("t", "c1", json!("done"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls(&seen), vec![r#"ok "done""#]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_without_callback() {
        let tracker = CompletionTracker::default();
        let seen = recording(&tracker, "t", "c1", Some(Duration::from_millis(10)));

        assert!(tracker.forget("t", "c1"));
        assert!(!tracker.forget("t", "c1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(calls(&seen).is_empty());
    }

    #[tokio::test]
    async fn test_stop_rejects_pending_and_is_idempotent() {
        let tracker = CompletionTracker::default();
        let a = recording(&tracker, "t1", "c1", None);
        let b = recording(&tracker, "t2", "c2", None);

        tracker.stop();
        tracker.stop();

        assert_eq!(calls(&a), vec!["err completion tracker stopped before 'c1' settled"]);
        assert_eq!(calls(&b).len(), 1);
        assert_eq!(tracker.pending_count("t1"), 0);
    }

    #[tokio::test]
    async fn test_register_after_stop_rejects_immediately() {
        let tracker = CompletionTracker::default();
        tracker.stop();

        let rx = tracker.register_channel("t", "c1", None);
        assert!(matches!(rx.await.unwrap(), Err(FlowError::Shutdown { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registrations_racing_stop_all_resolve() {
        let tracker = CompletionTracker::default();

        let registering = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                (0..200)
                    .map(|n| tracker.register_channel(&format!("t{}", n % 8), &format!("c{}", n), None))
                    .collect::<Vec<_>>()
            })
        };
        let stopping = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.stop() })
        };

        let receivers = registering.await.unwrap();
        stopping.await.unwrap();

        for rx in receivers {
            let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
                .await
                .expect("receiver left pending after stop");
            assert!(matches!(outcome.unwrap(), Err(FlowError::Shutdown { .. })));
        }
    }

    #[tokio::test]
    async fn test_remove_topic_leaves_others() {
        let tracker = CompletionTracker::default();
        let gone = recording(&tracker, "a", "c1", None);
        let kept = recording(&tracker, "b", "c2", None);

        tracker.remove_topic("a");

        assert_eq!(calls(&gone).len(), 1);
        assert!(calls(&kept).is_empty());
        assert_eq!(tracker.pending_count("b"), 1);
    }

    #[tokio::test]
    async fn test_listen_feeds_events() {
        let tracker = CompletionTracker::default();
        let (events, rx) = broadcast::channel(8);
        tracker.listen("t", rx);
        assert!(tracker.is_listening("t"));

        let result = tracker.register_channel("t", "c1", None);
        tracker.map_job_id("t", "c1", "c1");
        events
            .send(JobEvent::Completed {
                job_id: "c1".into(),
                payload: r#"{"ok":true}"#.into(),
            })
            .unwrap();

        assert_eq!(result.await.unwrap().unwrap(), json!({ "ok": true }));
    }
}

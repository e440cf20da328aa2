//! Execution Timeline
//!
//! Records step execution and compensation events in the order they
//! happened, for execution reports and Gantt charts.

use std::collections::HashMap;
use std::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step handler started
    Started,
    /// Step handler returned successfully
    Completed,
    /// Step handler returned an error
    Failed,
    /// Step was compensated
    RolledBack,
    /// Step compensation returned an error
    RollbackFailed,
}

impl EventType {
    /// Short lowercase label for reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
            Self::RollbackFailed => "rollback-failed",
        }
    }

    /// Returns true for events that end a step's forward execution.
    fn ends_execution(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Name of the step
    pub step_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// Tracks the execution timeline of one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the names of steps that saw a given event, in order.
    pub fn steps_with(&self, event_type: EventType) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .map(|e| e.step_id.as_str())
            .collect()
    }

    /// Renders every event as `step:label`, in order.
    pub fn trace(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|e| format!("{}:{}", e.step_id, e.event_type.label()))
            .collect()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Generates an ASCII Gantt chart of forward execution.
    ///
    /// Compensated steps are flagged with `(rolled back)`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = Instant::now().duration_since(self.start_time).as_millis();

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut step_times: HashMap<String, (u128, u128)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();

            match event.event_type {
                EventType::Started => {
                    step_times
                        .entry(event.step_id.clone())
                        .or_insert((elapsed, 0))
                        .0 = elapsed;
                }
                t if t.ends_execution() => {
                    if let Some(times) = step_times.get_mut(&event.step_id) {
                        times.1 = elapsed;
                    }
                }
                _ => {}
            }
        }

        let rolled_back = self.steps_with(EventType::RolledBack);

        let mut sorted_steps: Vec<_> = step_times.into_iter().collect();
        sorted_steps.sort_by_key(|(_, (start, _))| *start);

        for (step_id, (start, end)) in sorted_steps {
            if end >= start {
                let start_pos = (start as f64 * scale) as usize;
                let duration = ((end - start) as f64 * scale).max(1.0) as usize;

                let mut bar = " ".repeat(start_pos);
                bar.push_str(&"#".repeat(duration));

                let marker = if rolled_back.contains(&step_id.as_str()) {
                    " (rolled back)"
                } else {
                    ""
                };

                output.push_str(&format!(
                    "{:12} |{}| ({} ms){}\n",
                    truncate(&step_id, 12),
                    bar,
                    end - start,
                    marker
                ));
            }
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns forward execution durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<String, u128> = HashMap::new();
        let mut durations: HashMap<String, u128> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();

            match event.event_type {
                EventType::Started => {
                    starts.insert(event.step_id.clone(), elapsed);
                }
                t if t.ends_execution() => {
                    if let Some(start) = starts.get(&event.step_id) {
                        durations.insert(event.step_id.clone(), elapsed - start);
                    }
                }
                _ => {}
            }
        }

        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

//! Step Lifecycle State
//!
//! Tracks where every step of one execution is in its lifecycle:
//!
//! ```text
//! Pending -> Executing -> Completed -> RolledBack
//!                      \-> Failed
//! ```
//!
//! A failed step is never compensated, so `Failed` has no way out.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::WorkflowLayout;

/// Lifecycle state of a single step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    /// Not started yet
    Pending,
    /// Handler is running
    Executing,
    /// Handler succeeded; eligible for compensation
    Completed,
    /// Handler failed
    Failed,
    /// Compensation ran successfully
    RolledBack,
}

impl StepState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: StepState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Executing)
                | (Self::Executing, Self::Completed)
                | (Self::Executing, Self::Failed)
                | (Self::Completed, Self::RolledBack)
        )
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
        };
        write!(f, "{}", label)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step}' cannot move from {from} to {to}")]
    Illegal {
        step: String,
        from: StepState,
        to: StepState,
    },
}

/// Per-step states of one execution.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FlowState {
    /// Execution this state belongs to
    pub flow_id: String,

    /// State of every declared step, in declared order
    pub steps: IndexMap<String, StepState>,

    /// First step that failed (if any)
    pub failed_step: Option<String>,

    /// Last time a transition was applied
    pub updated_at: DateTime<Utc>,
}

impl FlowState {
    /// Creates a state with every step of the layout pending.
    pub fn new(flow_id: impl Into<String>, layout: &WorkflowLayout) -> Self {
        Self {
            flow_id: flow_id.into(),
            steps: layout
                .step_names()
                .map(|name| (name.to_string(), StepState::Pending))
                .collect(),
            failed_step: None,
            updated_at: Utc::now(),
        }
    }

    /// Applies a transition, rejecting illegal ones.
    pub fn transition(&mut self, step: &str, next: StepState) -> Result<(), TransitionError> {
        let current = self
            .steps
            .get_mut(step)
            .ok_or_else(|| TransitionError::UnknownStep(step.to_string()))?;

        if !current.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                step: step.to_string(),
                from: *current,
                to: next,
            });
        }

        *current = next;
        if next == StepState::Failed && self.failed_step.is_none() {
            self.failed_step = Some(step.to_string());
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Returns the current state of a step.
    pub fn state(&self, step: &str) -> Option<StepState> {
        self.steps.get(step).copied()
    }

    /// Names of steps currently in the given state, in declared order.
    pub fn steps_in(&self, state: StepState) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Returns true if every step completed.
    pub fn is_complete(&self) -> bool {
        self.steps.values().all(|s| *s == StepState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::StepGroup;

    fn state() -> FlowState {
        let layout = WorkflowLayout::new("order")
            .with_group(StepGroup::sequential(["charge", "reserve"]))
            .with_group(StepGroup::parallel(["ship"]));
        FlowState::new("flow-1", &layout)
    }

    #[test]
    fn test_state_creation() {
        let state = state();
        assert_eq!(state.flow_id, "flow-1");
        assert_eq!(state.steps_in(StepState::Pending), vec!["charge", "reserve", "ship"]);
        assert!(state.failed_step.is_none());
        assert!(!state.is_complete());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = state();
        for step in ["charge", "reserve", "ship"] {
            state.transition(step, StepState::Executing).unwrap();
            state.transition(step, StepState::Completed).unwrap();
        }
        assert!(state.is_complete());
    }

    #[test]
    fn test_completed_step_can_roll_back() {
        let mut state = state();
        state.transition("charge", StepState::Executing).unwrap();
        state.transition("charge", StepState::Completed).unwrap();
        state.transition("charge", StepState::RolledBack).unwrap();

        assert_eq!(state.state("charge"), Some(StepState::RolledBack));
        assert!(StepState::RolledBack.is_terminal());
    }

    #[test]
    fn test_failed_step_never_rolls_back() {
        let mut state = state();
        state.transition("reserve", StepState::Executing).unwrap();
        state.transition("reserve", StepState::Failed).unwrap();

        let err = state.transition("reserve", StepState::RolledBack).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                step: "reserve".to_string(),
                from: StepState::Failed,
                to: StepState::RolledBack,
            }
        );
        assert_eq!(state.failed_step, Some("reserve".to_string()));
    }

    #[test]
    fn test_pending_cannot_skip_execution() {
        let mut state = state();
        assert!(state.transition("ship", StepState::Completed).is_err());
        assert!(state.transition("ship", StepState::RolledBack).is_err());
        assert_eq!(state.state("ship"), Some(StepState::Pending));
    }

    #[test]
    fn test_unknown_step() {
        let mut state = state();
        assert_eq!(
            state.transition("refund", StepState::Executing),
            Err(TransitionError::UnknownStep("refund".to_string()))
        );
    }

    #[test]
    fn test_first_failure_is_kept() {
        let mut state = state();
        for step in ["charge", "reserve"] {
            state.transition(step, StepState::Executing).unwrap();
            state.transition(step, StepState::Failed).unwrap();
        }
        assert_eq!(state.failed_step, Some("charge".to_string()));
    }

    #[test]
    fn test_state_serialization_roundtrip() {
        let mut state = state();
        state.transition("charge", StepState::Executing).unwrap();

        let json = serde_json::to_string_pretty(&state).unwrap();
        assert!(json.contains("\"executing\""));

        let loaded: FlowState = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.state("charge"), Some(StepState::Executing));
        assert_eq!(loaded.steps.len(), 3);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(StepState::RolledBack.to_string(), "rolled-back");
        assert_eq!(StepState::Pending.to_string(), "pending");
    }
}

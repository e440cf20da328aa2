//! Workflow Validation
//!
//! Checks a workflow before it can run:
//! - Layout structure (name, non-empty groups, unique step names)
//! - Handler bindings (every step has exactly one handler, no strays)
//!
//! All problems are collected and reported together.

use std::collections::{HashMap, HashSet};

use log::{debug, info};

use super::model::{StepHandler, WorkflowLayout};
use crate::error::FlowError;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyName,
    EmptyWorkflow,
    EmptyGroup(usize),
    EmptyStepName { group: usize },
    DuplicateStep(String),
    MissingHandler(String),
    DuplicateHandler(String),
    UnusedHandler(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "Workflow has no name"),
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::EmptyGroup(index) => write!(f, "Step group {} has no steps", index),
            Self::EmptyStepName { group } => {
                write!(f, "Step group {} contains an empty step name", group)
            }
            Self::DuplicateStep(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::MissingHandler(name) => write!(f, "Step '{}' has no handler", name),
            Self::DuplicateHandler(name) => {
                write!(f, "Step '{}' has more than one handler bound", name)
            }
            Self::UnusedHandler(name) => {
                write!(f, "Handler '{}' is not referenced by any step group", name)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates the structure of a layout.
///
/// Performs the following checks:
/// 1. Workflow has a name
/// 2. Workflow has at least one step
/// 3. No group is empty
/// 4. No step name is blank
/// 5. Step names are unique across all groups
pub fn validate_layout(layout: &WorkflowLayout) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if layout.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }

    if layout.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (index, group) in layout.step_groups.iter().enumerate() {
        if group.is_empty() {
            errors.push(ValidationError::EmptyGroup(index));
            continue;
        }

        for step in &group.steps {
            if step.trim().is_empty() {
                errors.push(ValidationError::EmptyStepName { group: index });
            } else if !seen.insert(step.as_str()) {
                errors.push(ValidationError::DuplicateStep(step.clone()));
            }
        }

        debug!(
            "Group {} ({}): {} steps",
            index,
            group.mode,
            group.len()
        );
    }

    errors
}

/// Checks the handler map against the layout's step names.
pub fn validate_handlers(
    layout: &WorkflowLayout,
    handlers: &HashMap<String, StepHandler>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let declared: HashSet<&str> = layout.step_names().collect();

    for step in layout.step_names() {
        if !step.trim().is_empty() && !handlers.contains_key(step) {
            errors.push(ValidationError::MissingHandler(step.to_string()));
        }
    }

    let mut unused: Vec<&String> = handlers
        .keys()
        .filter(|name| !declared.contains(name.as_str()))
        .collect();
    unused.sort();
    errors.extend(
        unused
            .into_iter()
            .map(|name| ValidationError::UnusedHandler(name.clone())),
    );

    errors
}

/// Validates a complete definition before it is built.
pub fn validate_definition(
    layout: &WorkflowLayout,
    handlers: &HashMap<String, StepHandler>,
    duplicate_handlers: &[String],
) -> Result<(), FlowError> {
    info!(
        "Validating workflow '{}' with {} steps",
        layout.name,
        layout.step_count()
    );

    let mut errors = validate_layout(layout);
    errors.extend(
        duplicate_handlers
            .iter()
            .map(|name| ValidationError::DuplicateHandler(name.clone())),
    );
    errors.extend(validate_handlers(layout, handlers));

    if !errors.is_empty() {
        return Err(FlowError::Validation(errors));
    }

    info!(
        "Workflow '{}' validated: {} groups, {} steps",
        layout.name,
        layout.step_groups.len(),
        layout.step_count()
    );
    Ok(())
}

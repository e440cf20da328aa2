//! Workflow Layout Parser
//!
//! Handles loading and saving workflow layouts as YAML. A layout only
//! describes names and groups; handlers are bound in code with
//! [`WorkflowDefinition::from_layout`](super::WorkflowDefinition::from_layout).

use std::error::Error;
use std::fs;

use log::{debug, info};

use super::model::WorkflowLayout;
use super::validator::validate_layout;

/// Parses a layout from YAML text and checks its structure.
pub fn parse_layout(yaml_content: &str) -> Result<WorkflowLayout, Box<dyn Error>> {
    let layout: WorkflowLayout = serde_yaml::from_str(yaml_content).map_err(|e| {
        format!(
            "Failed to parse workflow YAML: {}. Check the file format.",
            e
        )
    })?;

    info!(
        "Parsed workflow '{}': {} groups, {} steps",
        layout.name,
        layout.step_groups.len(),
        layout.step_count()
    );

    let errors = validate_layout(&layout);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(messages.join("\n").into());
    }

    Ok(layout)
}

/// Loads a workflow layout from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_layout;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let layout = load_layout("place_order.yaml")?;
///     println!("Loaded {} steps", layout.step_count());
///     Ok(())
/// }
/// ```
pub fn load_layout(path: &str) -> Result<WorkflowLayout, Box<dyn Error>> {
    info!("Loading workflow layout from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_layout(&yaml_content)
}

/// Saves a workflow layout to a YAML file.
pub fn save_layout(layout: &WorkflowLayout, path: &str) -> Result<(), Box<dyn Error>> {
    let yaml_content = serde_yaml::to_string(layout)?;
    fs::write(path, yaml_content)?;
    info!("Workflow layout saved to: {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{GroupMode, StepGroup};
    use tempfile::tempdir;

    const ORDER_YAML: &str = r#"
name: place_order
description: Charge, reserve and ship an order
step_groups:
  - mode: sequential
    steps: [charge, reserve]
  - mode: parallel
    steps:
      - ship
      - notify
"#;

    #[test]
    fn test_parse_layout() {
        let layout = parse_layout(ORDER_YAML).unwrap();

        assert_eq!(layout.name, "place_order");
        assert_eq!(layout.step_groups.len(), 2);
        assert_eq!(layout.step_groups[0].mode, GroupMode::Sequential);
        assert_eq!(layout.step_groups[1].mode, GroupMode::Parallel);
        assert_eq!(layout.step_groups[1].steps, vec!["ship", "notify"]);
        assert!(layout.description.is_some());
    }

    #[test]
    fn test_parse_layout_rejects_duplicate_steps() {
        let yaml = r#"
name: broken
step_groups:
  - steps: [a, b]
  - mode: parallel
    steps: [b]
"#;
        let err = parse_layout(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate step name: 'b'"));
    }

    #[test]
    fn test_parse_layout_rejects_unknown_mode() {
        let yaml = "name: x\nstep_groups:\n  - mode: sideways\n    steps: [a]\n";
        assert!(parse_layout(yaml).is_err());
    }

    #[test]
    fn test_load_layout_file_not_found() {
        let result = load_layout("/nonexistent/path/workflow.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_layout_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        std::fs::write(&path, "this is not valid yaml: [[[").unwrap();

        assert!(load_layout(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_save_and_load_layout() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("order.yaml");

        let layout = WorkflowLayout::new("order")
            .with_group(StepGroup::sequential(["charge"]))
            .with_group(StepGroup::parallel(["ship", "notify"]));

        save_layout(&layout, path.to_str().unwrap()).unwrap();
        let loaded = load_layout(path.to_str().unwrap()).unwrap();

        assert_eq!(loaded, layout);
    }
}

//! Workflow Parser
//!
//! Loads workflow definitions from YAML and validates them.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use super::model::WorkflowDefinition;
use super::validator::{validate_definition, ValidationErrors};

/// Failure to load a workflow definition.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read workflow file '{path}': {source}. Check that the file exists and is readable.")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse workflow YAML: {0}. Check the file format.")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Workflow validation failed:\n{0}")]
    Invalid(#[from] ValidationErrors),
}

/// Loads and validates a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use stateflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("rollout.yaml")?;
///     println!("Loaded {} states", workflow.states.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.display().to_string(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_workflow(&yaml_content)
}

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowDefinition, ParseError> {
    let workflow: WorkflowDefinition = serde_yaml::from_str(yaml)?;
    validate_definition(&workflow)?;

    info!(
        "Loaded workflow '{}' with {} states",
        workflow.name,
        workflow.states.len()
    );
    Ok(workflow)
}

/// Parses `500ms`, `2s`, `1m`, `1h` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }

    let seconds = match unit.trim() {
        "ms" => number / 1000.0,
        "" | "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

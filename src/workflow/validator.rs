//! Workflow Validation
//!
//! Checks a definition before it is compiled into a state graph:
//! - State field validation
//! - Reference integrity (transitions, fork children, repeat targets)
//! - No cycles across transitions and child edges
//!
//! Every problem of a definition is collected and reported together.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::{debug, info};
use thiserror::Error;

use super::model::{StateKind, WorkflowDefinition};
use super::parser::parse_duration;

/// A single problem in a workflow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Workflow has no states")]
    EmptyWorkflow,

    #[error("State has empty or whitespace-only name")]
    EmptyStateName,

    #[error("Duplicate state name: '{0}'")]
    DuplicateState(String),

    #[error("Initial state '{0}' is not defined")]
    UnknownInitial(String),

    #[error("State '{state}' references unknown state '{reference}'")]
    InvalidReference { state: String, reference: String },

    #[error("Fork '{0}' has no children")]
    EmptyFork(String),

    #[error("Repeat '{0}' has no target state")]
    MissingTransition(String),

    #[error("State '{state}' has invalid duration '{value}'")]
    InvalidDuration { state: String, value: String },

    #[error("Workflow contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// All problems found in one definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn contains(&self, error: &ValidationError) -> bool {
        self.0.contains(error)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("\n"))
    }
}

impl std::error::Error for ValidationErrors {}

/// Validates a workflow definition.
///
/// Performs the following checks:
/// 1. Workflow is not empty
/// 2. No empty or duplicate state names
/// 3. Initial state exists
/// 4. All references point to existing states
/// 5. Per-kind configuration (fork children, repeat target, wait duration)
/// 6. No cycles
pub fn validate_definition(workflow: &WorkflowDefinition) -> Result<(), ValidationErrors> {
    info!(
        "Validating workflow '{}' with {} states",
        workflow.name,
        workflow.states.len()
    );

    if workflow.states.is_empty() {
        return Err(ValidationErrors(vec![ValidationError::EmptyWorkflow]));
    }

    let mut errors = Vec::new();

    let mut names: HashSet<&str> = HashSet::new();
    for state in &workflow.states {
        if state.name.trim().is_empty() {
            errors.push(ValidationError::EmptyStateName);
        } else if !names.insert(state.name.as_str()) {
            errors.push(ValidationError::DuplicateState(state.name.clone()));
        }
    }

    if let Some(initial) = workflow.initial_state() {
        if !names.contains(initial) {
            errors.push(ValidationError::UnknownInitial(initial.to_string()));
        }
    }

    for state in &workflow.states {
        for reference in state.references() {
            if !names.contains(reference) {
                errors.push(ValidationError::InvalidReference {
                    state: state.name.clone(),
                    reference: reference.to_string(),
                });
            }
        }

        match &state.kind {
            StateKind::Fork { children } if children.is_empty() => {
                errors.push(ValidationError::EmptyFork(state.name.clone()));
            }
            StateKind::Repeat { target: None, .. } => {
                errors.push(ValidationError::MissingTransition(state.name.clone()));
            }
            StateKind::Wait { duration } if parse_duration(duration).is_none() => {
                errors.push(ValidationError::InvalidDuration {
                    state: state.name.clone(),
                    value: duration.clone(),
                });
            }
            StateKind::Shell {
                timeout: Some(timeout),
                ..
            } if parse_duration(timeout).is_none() => {
                errors.push(ValidationError::InvalidDuration {
                    state: state.name.clone(),
                    value: timeout.clone(),
                });
            }
            _ => {}
        }
    }

    if errors.is_empty() {
        if let Err(cycle) = check_acyclic(workflow) {
            errors.push(cycle);
        }
    }

    if !errors.is_empty() {
        return Err(ValidationErrors(errors));
    }

    info!("Workflow '{}' validated", workflow.name);
    Ok(())
}

/// Detects cycles with Kahn's algorithm over every edge a state can follow.
fn check_acyclic(workflow: &WorkflowDefinition) -> Result<(), ValidationError> {
    let mut in_degree: HashMap<&str, usize> =
        workflow.states.iter().map(|s| (s.name.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for state in &workflow.states {
        for reference in state.references() {
            successors.entry(state.name.as_str()).or_default().push(reference);
            if let Some(degree) = in_degree.get_mut(reference) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = workflow
        .states
        .iter()
        .map(|s| s.name.as_str())
        .filter(|name| in_degree.get(name) == Some(&0))
        .collect();

    let mut sorted_order: Vec<&str> = Vec::new();
    while let Some(current) = queue.pop_front() {
        sorted_order.push(current);
        for successor in successors.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
        }
    }

    if sorted_order.len() != workflow.states.len() {
        let mut stuck: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        stuck.sort();
        return Err(ValidationError::Cycle(stuck));
    }

    debug!("Topological order: {:?}", sorted_order);
    Ok(())
}

//! State Factory
//!
//! Compiles a validated [`WorkflowDefinition`] into a [`StateGraph`].

use std::sync::Arc;

use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::context::ElementType;
use crate::execution::State;
use crate::states::{ForkState, RepeatState, ShellState, TaskDispatcher, TaskState, WaitState};

use super::graph::{StateGraph, StateNode};
use super::model::{StateKind, WorkflowDefinition};
use super::parser::parse_duration;
use super::validator::{validate_definition, ValidationErrors};

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),

    #[error("state '{0}' is a task but no task dispatcher is configured")]
    NoTaskDispatcher(String),
}

/// Builds state implementations for definitions.
#[derive(Default, Clone)]
pub struct StateFactory {
    task_dispatcher: Option<Arc<dyn TaskDispatcher>>,
}

impl StateFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport used by `task` states.
    pub fn with_task_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.task_dispatcher = Some(dispatcher);
        self
    }

    pub fn build(&self, workflow: &WorkflowDefinition) -> Result<StateGraph, FactoryError> {
        validate_definition(workflow)?;

        let mut builder = StateGraph::builder(workflow.name.as_str());
        if let Some(initial) = workflow.initial_state() {
            builder = builder.initial(initial);
        }

        for definition in &workflow.states {
            let state = self.create(&definition.name, &definition.kind)?;
            debug!("Compiled state '{}' ({})", definition.name, state.kind());

            let mut node = StateNode::from_arc(definition.name.as_str(), state);
            if let Some(next) = &definition.next {
                node = node.with_next(next.as_str());
            }
            if let Some(on_failure) = &definition.on_failure {
                node = node.with_on_failure(on_failure.as_str());
            }
            builder = builder.state(node);
        }

        Ok(builder.build()?)
    }

    fn create(&self, name: &str, kind: &StateKind) -> Result<Arc<dyn State>, FactoryError> {
        let state: Arc<dyn State> = match kind {
            StateKind::Fork { children } => Arc::new(ForkState::new(children.iter().cloned())),

            StateKind::Repeat {
                elements,
                element_type,
                strategy,
                strategy_expression,
                target,
            } => {
                let expression = match elements {
                    Value::String(expression) => expression.clone(),
                    literal => literal.to_string(),
                };
                let mut repeat =
                    RepeatState::new(expression).with_element_type(ElementType::parse(element_type));
                if let Some(strategy) = strategy {
                    repeat = repeat.with_strategy(*strategy);
                }
                if let Some(expression) = strategy_expression {
                    repeat = repeat.with_strategy_expression(expression.as_str());
                }
                if let Some(target) = target {
                    repeat = repeat.with_target(target.as_str());
                }
                Arc::new(repeat)
            }

            StateKind::Wait { duration } => {
                // Validation already rejected unparsable durations.
                let duration = parse_duration(duration).unwrap_or_default();
                Arc::new(WaitState::new(duration))
            }

            StateKind::Shell { script, timeout } => {
                let mut shell = ShellState::new(script.as_str());
                if let Some(timeout) = timeout.as_deref().and_then(parse_duration) {
                    shell = shell.with_timeout(timeout);
                }
                Arc::new(shell)
            }

            StateKind::Task {
                task_type,
                parameters,
            } => {
                let dispatcher = self
                    .task_dispatcher
                    .clone()
                    .ok_or_else(|| FactoryError::NoTaskDispatcher(name.to_string()))?;
                Arc::new(TaskState::new(task_type.as_str(), dispatcher).with_parameters(parameters.clone()))
            }
        };
        Ok(state)
    }
}

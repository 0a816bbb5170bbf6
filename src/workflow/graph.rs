//! State Graph
//!
//! The compiled, executable form of a workflow: each node owns its
//! [`State`] implementation and its outgoing transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::execution::{ExecutionStatus, State};

use super::validator::{ValidationError, ValidationErrors};

/// One state of a compiled graph.
#[derive(Clone)]
pub struct StateNode {
    name: String,
    state: Arc<dyn State>,
    next: Option<String>,
    on_failure: Option<String>,
}

impl StateNode {
    pub fn new(name: impl Into<String>, state: impl State + 'static) -> Self {
        Self::from_arc(name, Arc::new(state))
    }

    pub fn from_arc(name: impl Into<String>, state: Arc<dyn State>) -> Self {
        Self {
            name: name.into(),
            state,
            next: None,
            on_failure: None,
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_on_failure(mut self, on_failure: impl Into<String>) -> Self {
        self.on_failure = Some(on_failure.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &Arc<dyn State> {
        &self.state
    }

    /// The state to continue with after finishing with `status`.
    ///
    /// ABORTED never transitions.
    pub fn transition_for(&self, status: ExecutionStatus) -> Option<&str> {
        match status {
            ExecutionStatus::Success => self.next.as_deref(),
            ExecutionStatus::Failed | ExecutionStatus::Error => self.on_failure.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Debug for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNode")
            .field("name", &self.name)
            .field("kind", &self.state.kind())
            .field("next", &self.next)
            .field("on_failure", &self.on_failure)
            .finish()
    }
}

/// An executable workflow.
#[derive(Debug, Clone)]
pub struct StateGraph {
    name: String,
    initial: String,
    nodes: HashMap<String, StateNode>,
}

impl StateGraph {
    pub fn builder(name: impl Into<String>) -> StateGraphBuilder {
        StateGraphBuilder {
            name: name.into(),
            initial: None,
            nodes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn node(&self, name: &str) -> Option<&StateNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Assembles a [`StateGraph`] in code.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stateflow::states::{ForkState, WaitState};
/// use stateflow::workflow::{StateGraph, StateNode};
///
/// let graph = StateGraph::builder("fan_out")
///     .state(StateNode::new("fork", ForkState::new(["left", "right"])))
///     .state(StateNode::new("left", WaitState::new(Duration::from_secs(1))))
///     .state(StateNode::new("right", WaitState::new(Duration::from_secs(2))))
///     .build()
///     .unwrap();
///
/// assert_eq!(graph.initial(), "fork");
/// ```
pub struct StateGraphBuilder {
    name: String,
    initial: Option<String>,
    nodes: Vec<StateNode>,
}

impl StateGraphBuilder {
    /// Starting state; defaults to the first added state.
    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial = Some(name.into());
        self
    }

    pub fn state(mut self, node: StateNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Checks names and transitions and freezes the graph.
    ///
    /// Children spawned by a state are not visible here; a child state that
    /// does not exist fails that child at dispatch time.
    pub fn build(self) -> Result<StateGraph, ValidationErrors> {
        let mut errors = Vec::new();

        let Some(initial) = self
            .initial
            .or_else(|| self.nodes.first().map(|n| n.name.clone()))
        else {
            return Err(ValidationErrors(vec![ValidationError::EmptyWorkflow]));
        };

        let mut nodes = HashMap::new();
        for node in self.nodes {
            if node.name.trim().is_empty() {
                errors.push(ValidationError::EmptyStateName);
            } else if nodes.contains_key(&node.name) {
                errors.push(ValidationError::DuplicateState(node.name.clone()));
            } else {
                nodes.insert(node.name.clone(), node);
            }
        }

        if !nodes.contains_key(&initial) {
            errors.push(ValidationError::UnknownInitial(initial.clone()));
        }

        for node in nodes.values() {
            for reference in node.next.iter().chain(node.on_failure.iter()) {
                if !nodes.contains_key(reference) {
                    errors.push(ValidationError::InvalidReference {
                        state: node.name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        Ok(StateGraph {
            name: self.name,
            initial,
            nodes,
        })
    }
}

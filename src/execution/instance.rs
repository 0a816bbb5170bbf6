//! Execution Instances
//!
//! The persisted, resumable record of one state's run within one workflow
//! execution. Everything the engine needs to resume an instance after a
//! process restart lives here: the context stack, correlation linkage, the
//! wait-set it is suspended on and the state's own execution data.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::{ContextElement, ContextStack, ElementType};

use super::response::NotifyResult;

/// Lifecycle status of an execution instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, not yet dispatched
    New,
    /// Executing, or suspended waiting on correlation ids
    Running,
    /// Completed successfully
    Success,
    /// Completed with an expected, non-crash failure
    Failed,
    /// A step-local crash or protocol violation
    Error,
    /// Held by an operator; may return to Running
    Paused,
    /// Cancelled
    Aborted,
}

impl ExecutionStatus {
    /// Returns true for statuses that never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Error | Self::Aborted)
    }

    /// Returns true for the statuses a step may finish with.
    pub fn is_finished_outcome(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Error)
    }

    /// Checks whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (New, Running) | (New, Paused) | (New, Aborted) => true,
            (Running, Success) | (Running, Failed) | (Running, Error) => true,
            (Running, Paused) | (Running, Aborted) => true,
            (Paused, Running) | (Paused, Aborted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Paused => "PAUSED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("instance '{instance_id}' cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub instance_id: String,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// The run record of one state within one workflow execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionInstance {
    /// Unique id of this instance
    pub id: String,

    /// Workflow (state graph) this instance belongs to
    pub workflow_name: String,

    /// Id shared by every instance of one workflow execution
    pub execution_id: String,

    /// Name of the state this instance runs
    pub state_name: String,

    status: ExecutionStatus,

    /// Elements visible to the state, most recent last
    #[serde(default)]
    pub context_elements: ContextStack,

    /// Correlation id reported when this instance's lineage ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,

    /// Predecessor in the same lineage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,

    /// Instance that spawned this lineage, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,

    /// Name of the element this instance was seeded with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_element_name: Option<String>,

    /// Type of the element this instance was seeded with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_element_type: Option<ElementType>,

    /// True for the first instance of a spawned lineage
    #[serde(default)]
    pub is_context_transition: bool,

    /// Set once the state's `execute` has been invoked
    #[serde(default)]
    pub executed: bool,

    /// State-owned data that must survive suspension
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub state_data: Value,

    /// Correlation ids this instance is suspended on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting_on: Vec<String>,

    /// Results delivered while the instance was paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_results: Option<HashMap<String, NotifyResult>>,

    /// Output of the last terminal response
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionInstance {
    /// Creates the first instance of a workflow execution.
    pub fn root(
        workflow_name: impl Into<String>,
        state_name: impl Into<String>,
        context_elements: ContextStack,
    ) -> Self {
        Self::blank(
            workflow_name.into(),
            Uuid::new_v4().to_string(),
            state_name.into(),
            context_elements,
        )
    }

    fn blank(
        workflow_name: String,
        execution_id: String,
        state_name: String,
        context_elements: ContextStack,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_name,
            execution_id,
            state_name,
            status: ExecutionStatus::New,
            context_elements,
            notify_id: None,
            prev_instance_id: None,
            parent_instance_id: None,
            context_element_name: None,
            context_element_type: None,
            is_context_transition: false,
            executed: false,
            state_data: Value::Null,
            waiting_on: Vec::new(),
            held_results: None,
            output: Value::Null,
            error_message: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Creates the next instance of this lineage.
    ///
    /// The successor inherits the context stack and the lineage's notify id.
    pub fn successor(&self, state_name: impl Into<String>) -> Self {
        let mut next = Self::blank(
            self.workflow_name.clone(),
            self.execution_id.clone(),
            state_name.into(),
            self.context_elements.clone(),
        );
        next.notify_id = self.notify_id.clone();
        next.prev_instance_id = Some(self.id.clone());
        next.parent_instance_id = self.parent_instance_id.clone();
        next.context_element_name = self.context_element_name.clone();
        next.context_element_type = self.context_element_type.clone();
        next
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Moves the instance to a new status, stamping timestamps.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                instance_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.waiting_on.clear();
        }

        self.status = next;
        Ok(())
    }

    /// Returns true when the instance is suspended on a wait-set.
    pub fn is_waiting(&self) -> bool {
        self.status == ExecutionStatus::Running && !self.waiting_on.is_empty()
    }

    /// Returns true once the instance has run its state at least once.
    pub fn has_started(&self) -> bool {
        self.executed
    }
}

/// Builds child instances for Fork and Repeat from an explicit template.
///
/// A child starts a fresh lineage: it carries the parent's context plus the
/// one element it is seeded with, a freshly generated identity and notify
/// id, and none of the parent's completion fields.
#[derive(Debug, Clone)]
pub struct ChildInstanceBuilder<'a> {
    parent: &'a ExecutionInstance,
    state_name: String,
    element: Option<ContextElement>,
}

impl<'a> ChildInstanceBuilder<'a> {
    /// Starts a child of `parent` that will run `state_name`.
    pub fn new(parent: &'a ExecutionInstance, state_name: impl Into<String>) -> Self {
        Self {
            parent,
            state_name: state_name.into(),
            element: None,
        }
    }

    /// Seeds the child with an element pushed on top of the inherited stack.
    pub fn with_element(mut self, element: ContextElement) -> Self {
        self.element = Some(element);
        self
    }

    pub fn build(self) -> ExecutionInstance {
        let mut context = self.parent.context_elements.clone();
        let mut child = ExecutionInstance::blank(
            self.parent.workflow_name.clone(),
            self.parent.execution_id.clone(),
            self.state_name,
            ContextStack::new(),
        );

        if let Some(element) = self.element {
            child.context_element_name = Some(element.name().to_string());
            child.context_element_type = Some(element.element_type().clone());
            context.push(element);
        }

        child.context_elements = context;
        child.notify_id = Some(Uuid::new_v4().to_string());
        child.parent_instance_id = Some(self.parent.id.clone());
        child.is_context_transition = true;
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_parent() -> ExecutionInstance {
        let mut stack = ContextStack::new();
        stack.push(ContextElement::new(ElementType::StandardParams, "params", json!({"app": "api"})));
        let mut parent = ExecutionInstance::root("deploy", "fan_out", stack);
        parent.transition(ExecutionStatus::Running).unwrap();
        parent.state_data = json!({"index": 3});
        parent
    }

    #[test]
    fn test_status_transitions() {
        use ExecutionStatus::*;
        assert!(New.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Success.can_transition_to(Running));
        assert!(!New.can_transition_to(Success));
        assert!(!Aborted.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Aborted));
    }

    #[test]
    fn test_transition_stamps_times() {
        let mut instance = ExecutionInstance::root("wf", "start", ContextStack::new());
        assert!(instance.started_at.is_none());

        instance.transition(ExecutionStatus::Running).unwrap();
        assert!(instance.started_at.is_some());
        assert!(instance.ended_at.is_none());

        instance.waiting_on = vec!["c1".to_string()];
        assert!(instance.is_waiting());

        instance.transition(ExecutionStatus::Success).unwrap();
        assert!(instance.ended_at.is_some());
        assert!(instance.waiting_on.is_empty());

        let err = instance.transition(ExecutionStatus::Running).unwrap_err();
        assert_eq!(err.from, ExecutionStatus::Success);
        assert_eq!(err.to, ExecutionStatus::Running);
    }

    #[test]
    fn test_child_starts_fresh_lineage() {
        let parent = running_parent();
        let child = ChildInstanceBuilder::new(&parent, "build")
            .with_element(ContextElement::new(ElementType::Fork, "Fork1", Value::Null))
            .build();

        assert_ne!(child.id, parent.id);
        assert_eq!(child.execution_id, parent.execution_id);
        assert_eq!(child.status(), ExecutionStatus::New);
        assert!(child.prev_instance_id.is_none());
        assert!(child.is_context_transition);
        assert!(child.notify_id.is_some());
        assert_eq!(child.parent_instance_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.context_element_name.as_deref(), Some("Fork1"));
        assert_eq!(child.context_element_type, Some(ElementType::Fork));
        assert_eq!(child.context_elements.len(), 2);
        assert_eq!(child.context_elements.top().unwrap().name(), "Fork1");
        assert!(child.state_data.is_null());
        assert!(child.started_at.is_none());
    }

    #[test]
    fn test_child_notify_ids_unique() {
        let parent = running_parent();
        let a = ChildInstanceBuilder::new(&parent, "x").build();
        let b = ChildInstanceBuilder::new(&parent, "x").build();
        assert_ne!(a.notify_id, b.notify_id);
    }

    #[test]
    fn test_successor_inherits_lineage() {
        let parent = running_parent();
        let child = ChildInstanceBuilder::new(&parent, "build").build();
        let next = child.successor("test");

        assert_eq!(next.prev_instance_id.as_deref(), Some(child.id.as_str()));
        assert_eq!(next.notify_id, child.notify_id);
        assert!(!next.is_context_transition);
        assert_eq!(next.context_elements, child.context_elements);
        assert_eq!(next.status(), ExecutionStatus::New);
    }

    #[test]
    fn test_instance_json_roundtrip_keeps_status() {
        let mut instance = running_parent();
        instance.waiting_on = vec!["a".to_string(), "b".to_string()];

        let json = serde_json::to_string(&instance).unwrap();
        assert!(json.contains("\"RUNNING\""));
        let restored: ExecutionInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, instance);
        assert!(restored.is_waiting());
    }
}

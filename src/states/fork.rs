//! Fork
//!
//! Spawns one child lineage per declared state, all at once, and waits for
//! every one of them. The parent succeeds only if every child succeeded.

use std::collections::HashMap;

use log::info;
use serde_json::{json, Map, Value};

use crate::context::{ContextElement, ElementType};
use crate::execution::{
    aggregate_status, ChildInstanceBuilder, ExecutionContext, ExecutionResponse, NotifyResult,
    SpawningExecutionResponse, State, StateError, StateResponse,
};

#[derive(Debug, Clone)]
pub struct ForkState {
    children: Vec<String>,
}

impl ForkState {
    pub fn new<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            children: children.into_iter().map(Into::into).collect(),
        }
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }
}

impl State for ForkState {
    fn kind(&self) -> &'static str {
        "fork"
    }

    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
        let parent = ctx.instance();
        if self.children.is_empty() {
            return Err(StateError::MissingTransition(parent.state_name.clone()));
        }

        let mut branches = Map::new();
        let children: Vec<_> = self
            .children
            .iter()
            .enumerate()
            .map(|(i, state_name)| {
                let element = ContextElement::new(
                    ElementType::Fork,
                    format!("Fork{}", i),
                    json!({ "index": i, "state": state_name }),
                );
                let child = ChildInstanceBuilder::new(parent, state_name.as_str())
                    .with_element(element)
                    .build();
                if let Some(notify_id) = &child.notify_id {
                    branches.insert(notify_id.clone(), Value::String(state_name.clone()));
                }
                child
            })
            .collect();

        info!(
            "Fork '{}' spawning {} branch(es)",
            parent.state_name,
            children.len()
        );

        Ok(SpawningExecutionResponse::new(children)
            .with_execution_data(json!({ "branches": branches }))
            .into())
    }

    fn resume(
        &self,
        ctx: &ExecutionContext<'_>,
        results: &HashMap<String, NotifyResult>,
    ) -> Result<StateResponse, StateError> {
        let branches = &ctx.instance().state_data["branches"];

        let mut output = Map::new();
        for (notify_id, result) in results {
            let key = branches[notify_id]
                .as_str()
                .map(|name| format!("{}:{}", name, notify_id))
                .unwrap_or_else(|| notify_id.clone());
            output.insert(key, json!(result.status));
        }

        Ok(ExecutionResponse::completed(aggregate_status(results))
            .with_output(Value::Object(output))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStack;
    use crate::execution::{ExecutionInstance, ExecutionStatus};
    use crate::states::harness::Harness;

    fn fork_instance() -> ExecutionInstance {
        let mut instance = ExecutionInstance::root("deploy", "fan_out", ContextStack::new());
        instance.transition(ExecutionStatus::Running).unwrap();
        instance
    }

    #[test]
    fn test_spawns_named_children() {
        let harness = Harness::new();
        let instance = fork_instance();
        let fork = ForkState::new(["build", "lint", "test"]);

        let response = fork.execute(&harness.ctx(&instance)).unwrap();
        assert!(response.validate().is_ok());
        assert!(response.is_async());

        let children = response.children();
        assert_eq!(children.len(), 3);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.context_element_name, Some(format!("Fork{}", i)));
            assert_eq!(child.context_element_type, Some(ElementType::Fork));
            assert!(child.is_context_transition);
            assert!(child.prev_instance_id.is_none());
        }
        assert_eq!(children[1].state_name, "lint");
        assert_eq!(response.response().correlation_ids.len(), 3);
    }

    #[test]
    fn test_aggregation_any_order() {
        let harness = Harness::new();
        let fork = ForkState::new(["a", "b", "c"]);
        let mut instance = fork_instance();
        let response = fork.execute(&harness.ctx(&instance)).unwrap();
        instance.state_data = response.response().execution_data.clone().unwrap();

        let ids = response.response().correlation_ids.clone();
        let statuses = [ExecutionStatus::Success, ExecutionStatus::Failed, ExecutionStatus::Success];

        // Every rotation of the same outcomes reduces identically.
        for shift in 0..3 {
            let results: HashMap<String, NotifyResult> = (0..3)
                .map(|i| (ids[(i + shift) % 3].clone(), NotifyResult::new(statuses[i])))
                .collect();
            let resumed = fork.resume(&harness.ctx(&instance), &results).unwrap();
            assert_eq!(resumed.response().status, ExecutionStatus::Failed);
        }

        let all_good: HashMap<String, NotifyResult> =
            ids.iter().map(|id| (id.clone(), NotifyResult::success())).collect();
        let resumed = fork.resume(&harness.ctx(&instance), &all_good).unwrap();
        assert_eq!(resumed.response().status, ExecutionStatus::Success);
        assert!(!resumed.is_async());
    }

    #[test]
    fn test_empty_fork_is_configuration_error() {
        let harness = Harness::new();
        let instance = fork_instance();
        let err = ForkState::new(Vec::<String>::new())
            .execute(&harness.ctx(&instance))
            .unwrap_err();
        assert!(err.is_configuration());
    }
}

//! Remote Task
//!
//! Hands work to an external agent through a host-provided
//! [`TaskDispatcher`] and suspends on a correlation id. The agent's
//! completion comes back through `Engine::notify`.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::execution::{ExecutionContext, ExecutionResponse, State, StateError, StateResponse};

/// A unit of work for a remote agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// Report completion with `notify(correlation_id, ...)`
    pub correlation_id: String,
    pub task_type: String,
    /// Parameters with every `${...}` already rendered
    pub parameters: BTreeMap<String, String>,
    pub instance_id: String,
    pub execution_id: String,
}

/// Transport to remote execution agents.
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, request: TaskRequest) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Best-effort cancellation of a dispatched task.
    fn cancel(&self, _correlation_id: &str) {}
}

#[derive(Clone)]
pub struct TaskState {
    task_type: String,
    parameters: BTreeMap<String, String>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl TaskState {
    pub fn new(task_type: impl Into<String>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            task_type: task_type.into(),
            parameters: BTreeMap::new(),
            dispatcher,
        }
    }

    /// Adds a parameter template rendered against the context at dispatch.
    pub fn with_parameter(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), template.into());
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters.extend(parameters);
        self
    }
}

impl State for TaskState {
    fn kind(&self) -> &'static str {
        "task"
    }

    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
        let mut parameters = BTreeMap::new();
        for (key, template) in &self.parameters {
            let rendered = ctx.evaluator().render(template, ctx.elements())?;
            parameters.insert(key.clone(), rendered);
        }

        let instance = ctx.instance();
        let request = TaskRequest {
            correlation_id: Uuid::new_v4().to_string(),
            task_type: self.task_type.clone(),
            parameters,
            instance_id: instance.id.clone(),
            execution_id: instance.execution_id.clone(),
        };
        let correlation_id = request.correlation_id.clone();

        info!(
            "Dispatching '{}' task for state '{}' ({})",
            self.task_type, instance.state_name, correlation_id
        );
        self.dispatcher
            .dispatch(request)
            .map_err(|e| StateError::Dispatch(e.to_string()))?;

        Ok(ExecutionResponse::wait_on(vec![correlation_id.clone()])
            .with_execution_data(json!({ "correlation_id": correlation_id, "task_type": self.task_type }))
            .into())
    }

    fn handle_abort(&self, ctx: &ExecutionContext<'_>) {
        match ctx.instance().state_data["correlation_id"].as_str() {
            Some(correlation_id) => self.dispatcher.cancel(correlation_id),
            None => warn!(
                "Task state '{}' aborted before dispatch",
                ctx.instance().state_name
            ),
        }
    }
}

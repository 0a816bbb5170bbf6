//! Execution Response Protocol
//!
//! What a state hands back to the engine after `execute` or `resume`:
//! either a terminal outcome, a suspension on correlation ids, or a
//! spawning response that also creates the child instances it waits on.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::instance::{ExecutionInstance, ExecutionStatus};

/// Result delivered for one correlation id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotifyResult {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl NotifyResult {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            data: Value::Null,
            error_message: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ExecutionStatus::Success)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ExecutionStatus::Failed).with_error(message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Outcome of one `execute` or `resume` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResponse {
    pub status: ExecutionStatus,
    pub is_async: bool,
    pub correlation_ids: Vec<String>,
    /// State data to persist on the instance (`None` keeps the current data)
    pub execution_data: Option<Value>,
    /// Output recorded on a terminal response
    pub output: Value,
    pub error_message: Option<String>,
}

impl ExecutionResponse {
    /// Terminal response with the given status.
    pub fn completed(status: ExecutionStatus) -> Self {
        Self {
            status,
            is_async: false,
            correlation_ids: Vec::new(),
            execution_data: None,
            output: Value::Null,
            error_message: None,
        }
    }

    pub fn success() -> Self {
        Self::completed(ExecutionStatus::Success)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::completed(ExecutionStatus::Failed).with_error(message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::completed(ExecutionStatus::Error).with_error(message)
    }

    /// Suspends the owner until every id has been notified.
    pub fn wait_on(correlation_ids: Vec<String>) -> Self {
        Self {
            status: ExecutionStatus::Running,
            is_async: true,
            correlation_ids,
            execution_data: None,
            output: Value::Null,
            error_message: None,
        }
    }

    pub fn with_execution_data(mut self, data: Value) -> Self {
        self.execution_data = Some(data);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Asynchronous response that also creates the children it waits on.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawningExecutionResponse {
    pub response: ExecutionResponse,
    pub child_instances: Vec<ExecutionInstance>,
}

impl SpawningExecutionResponse {
    /// Waits on exactly the notify ids of `children`.
    pub fn new(children: Vec<ExecutionInstance>) -> Self {
        let correlation_ids = children.iter().filter_map(|c| c.notify_id.clone()).collect();
        Self {
            response: ExecutionResponse::wait_on(correlation_ids),
            child_instances: children,
        }
    }

    pub fn with_execution_data(mut self, data: Value) -> Self {
        self.response.execution_data = Some(data);
        self
    }
}

/// Anything a state may return.
#[derive(Debug, Clone, PartialEq)]
pub enum StateResponse {
    Execution(ExecutionResponse),
    Spawning(SpawningExecutionResponse),
}

impl StateResponse {
    pub fn response(&self) -> &ExecutionResponse {
        match self {
            Self::Execution(response) => response,
            Self::Spawning(spawning) => &spawning.response,
        }
    }

    pub fn is_async(&self) -> bool {
        self.response().is_async
    }

    pub fn children(&self) -> &[ExecutionInstance] {
        match self {
            Self::Execution(_) => &[],
            Self::Spawning(spawning) => &spawning.child_instances,
        }
    }

    /// Checks the response against the protocol rules.
    pub fn validate(&self) -> Result<(), ProtocolViolation> {
        let response = self.response();

        if response.is_async {
            if response.correlation_ids.is_empty() {
                return Err(ProtocolViolation::AsyncWithoutCorrelation);
            }
            if response.status.is_terminal() {
                return Err(ProtocolViolation::TerminalAsync(response.status));
            }
            let unique: HashSet<&String> = response.correlation_ids.iter().collect();
            if unique.len() != response.correlation_ids.len() {
                return Err(ProtocolViolation::DuplicateCorrelation);
            }
        } else if !response.status.is_finished_outcome() {
            return Err(ProtocolViolation::NonTerminalSync(response.status));
        }

        if let Self::Spawning(spawning) = self {
            if !response.is_async {
                return Err(ProtocolViolation::SyncSpawn);
            }

            let mut notify_ids = HashSet::new();
            for child in &spawning.child_instances {
                let notify_id = child
                    .notify_id
                    .as_ref()
                    .ok_or_else(|| ProtocolViolation::ChildWithoutNotifyId(child.id.clone()))?;
                notify_ids.insert(notify_id);
            }

            let declared: HashSet<&String> = response.correlation_ids.iter().collect();
            if notify_ids != declared || notify_ids.len() != spawning.child_instances.len() {
                return Err(ProtocolViolation::CorrelationMismatch {
                    declared: response.correlation_ids.len(),
                    children: spawning.child_instances.len(),
                });
            }
        }

        Ok(())
    }
}

impl From<ExecutionResponse> for StateResponse {
    fn from(response: ExecutionResponse) -> Self {
        Self::Execution(response)
    }
}

impl From<SpawningExecutionResponse> for StateResponse {
    fn from(response: SpawningExecutionResponse) -> Self {
        Self::Spawning(response)
    }
}

/// A response that breaks the execution protocol.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolViolation {
    #[error("asynchronous response declares no correlation ids")]
    AsyncWithoutCorrelation,

    #[error("asynchronous response carries terminal status {0}")]
    TerminalAsync(ExecutionStatus),

    #[error("synchronous response carries non-terminal status {0}")]
    NonTerminalSync(ExecutionStatus),

    #[error("asynchronous response declares the same correlation id twice")]
    DuplicateCorrelation,

    #[error("spawning response must be asynchronous")]
    SyncSpawn,

    #[error("child instance '{0}' has no notify id")]
    ChildWithoutNotifyId(String),

    #[error("spawning response waits on {declared} correlation ids that do not match its {children} children")]
    CorrelationMismatch { declared: usize, children: usize },
}

/// Reduces a set of results: SUCCESS only if every result succeeded.
///
/// Order-independent, so completion order never affects the outcome.
pub fn aggregate_status(results: &HashMap<String, NotifyResult>) -> ExecutionStatus {
    if results.values().all(|r| r.status == ExecutionStatus::Success) {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStack;
    use crate::execution::ChildInstanceBuilder;

    fn parent() -> ExecutionInstance {
        ExecutionInstance::root("wf", "fork", ContextStack::new())
    }

    #[test]
    fn test_spawning_declares_child_notify_ids() {
        let parent = parent();
        let children = vec![
            ChildInstanceBuilder::new(&parent, "a").build(),
            ChildInstanceBuilder::new(&parent, "b").build(),
        ];
        let spawning = SpawningExecutionResponse::new(children.clone());

        assert!(spawning.response.is_async);
        assert_eq!(spawning.response.correlation_ids.len(), 2);
        for child in &children {
            assert!(spawning.response.correlation_ids.contains(child.notify_id.as_ref().unwrap()));
        }
        assert!(StateResponse::from(spawning).validate().is_ok());
    }

    #[test]
    fn test_mismatched_correlation_rejected() {
        let parent = parent();
        let mut spawning = SpawningExecutionResponse::new(vec![ChildInstanceBuilder::new(&parent, "a").build()]);
        spawning.response.correlation_ids = vec!["someone-else".to_string()];

        assert!(matches!(
            StateResponse::from(spawning).validate(),
            Err(ProtocolViolation::CorrelationMismatch { .. })
        ));
    }

    #[test]
    fn test_child_without_notify_id_rejected() {
        let parent = parent();
        let mut child = ChildInstanceBuilder::new(&parent, "a").build();
        child.notify_id = None;
        let spawning = SpawningExecutionResponse {
            response: ExecutionResponse::wait_on(vec!["x".to_string()]),
            child_instances: vec![child],
        };

        assert!(matches!(
            StateResponse::from(spawning).validate(),
            Err(ProtocolViolation::ChildWithoutNotifyId(_))
        ));
    }

    #[test]
    fn test_async_rules() {
        let empty = StateResponse::from(ExecutionResponse::wait_on(Vec::new()));
        assert_eq!(empty.validate(), Err(ProtocolViolation::AsyncWithoutCorrelation));

        let mut terminal = ExecutionResponse::wait_on(vec!["c".to_string()]);
        terminal.status = ExecutionStatus::Success;
        assert!(matches!(
            StateResponse::from(terminal).validate(),
            Err(ProtocolViolation::TerminalAsync(ExecutionStatus::Success))
        ));

        let duplicate = ExecutionResponse::wait_on(vec!["c".to_string(), "c".to_string()]);
        assert_eq!(
            StateResponse::from(duplicate).validate(),
            Err(ProtocolViolation::DuplicateCorrelation)
        );

        let running_sync = ExecutionResponse::completed(ExecutionStatus::Running);
        assert!(StateResponse::from(running_sync).validate().is_err());

        assert!(StateResponse::from(ExecutionResponse::failed("nope")).validate().is_ok());
    }

    #[test]
    fn test_aggregate_is_commutative() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), NotifyResult::success());
        results.insert("b".to_string(), NotifyResult::success());
        assert_eq!(aggregate_status(&results), ExecutionStatus::Success);

        results.insert("c".to_string(), NotifyResult::new(ExecutionStatus::Error));
        assert_eq!(aggregate_status(&results), ExecutionStatus::Failed);
    }
}

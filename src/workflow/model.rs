//! Workflow Data Model
//!
//! Serializable definition of a state machine, as read from YAML.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: rollout
//! initial: each_host
//! states:
//!   - name: each_host
//!     type: repeat
//!     elements: ${elements.standard_params.hosts}
//!     element_type: instance
//!     strategy: SERIAL
//!     target: deploy_host
//!     next: settle
//!
//!   - name: deploy_host
//!     type: shell
//!     script: ./deploy.sh "$STATEFLOW_INSTANCE"
//!     timeout: 10m
//!
//!   - name: settle
//!     type: wait
//!     duration: 30s
//! ```

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::states::ExecutionStrategy;

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,

    /// First state; defaults to the first declared state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(default)]
    pub states: Vec<StateDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial: None,
            states: Vec::new(),
        }
    }

    pub fn with_initial(mut self, initial: impl Into<String>) -> Self {
        self.initial = Some(initial.into());
        self
    }

    pub fn with_state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    /// Name of the state execution starts at.
    pub fn initial_state(&self) -> Option<&str> {
        self.initial
            .as_deref()
            .or_else(|| self.states.first().map(|s| s.name.as_str()))
    }

    pub fn get_state(&self, name: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.name == name)
    }
}

/// One node of the state machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StateDefinition {
    pub name: String,

    #[serde(flatten)]
    pub kind: StateKind,

    /// Followed after SUCCESS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    /// Followed after FAILED or ERROR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

impl StateDefinition {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            name: name.into().trim().to_string(),
            kind,
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

    /// Every state this one can lead to: transitions plus spawned children.
    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.next.iter().chain(self.on_failure.iter()).map(String::as_str).collect();
        match &self.kind {
            StateKind::Fork { children } => refs.extend(children.iter().map(String::as_str)),
            StateKind::Repeat { target: Some(target), .. } => refs.push(target),
            _ => {}
        }
        refs
    }
}

/// The state variant and its configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateKind {
    Fork {
        #[serde(default)]
        children: Vec<String>,
    },

    Repeat {
        /// Expression, or a literal YAML list
        elements: Value,
        #[serde(default = "default_element_type")]
        element_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<ExecutionStrategy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy_expression: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },

    Wait {
        /// `500ms`, `2s`, `1m`, `1h` or bare seconds
        #[serde(deserialize_with = "string_or_number")]
        duration: String,
    },

    Shell {
        script: String,
        /// Kill the script after this long; same format as `duration`
        #[serde(
            default,
            deserialize_with = "optional_string_or_number",
            skip_serializing_if = "Option::is_none"
        )]
        timeout: Option<String>,
    },

    Task {
        task_type: String,
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
}

impl StateKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Fork { .. } => "fork",
            Self::Repeat { .. } => "repeat",
            Self::Wait { .. } => "wait",
            Self::Shell { .. } => "shell",
            Self::Task { .. } => "task",
        }
    }
}

fn default_element_type() -> String {
    "repeat_element".to_string()
}

/// Accepts `duration: 5` as well as `duration: "5s"`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(de::Error::custom("Expected a duration string or number of seconds")),
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    string_or_number(deserializer).map(Some)
}

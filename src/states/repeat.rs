//! Repeat
//!
//! Iterates a collection evaluated once, on first execution, spawning one
//! child lineage of the target state per element.
//!
//! - PARALLEL: every child at once, aggregated like a fork
//! - SERIAL: one child at a time, the next only after the previous one
//!   reported SUCCESS
//!
//! The element list, the strategy and the serial index live in the
//! instance's execution data. Nothing about the iteration is kept in
//! memory between `execute` and `resume`.

use std::collections::HashMap;
use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::{ContextElement, ElementType};
use crate::execution::{
    aggregate_status, finished_status, ChildInstanceBuilder, ExecutionContext, ExecutionInstance,
    ExecutionResponse, ExecutionStatus, NotifyResult, SpawningExecutionResponse, State, StateError,
    StateResponse,
};

/// How Repeat dispatches its children.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStrategy {
    #[serde(alias = "parallel")]
    Parallel,
    #[serde(alias = "serial")]
    Serial,
}

impl ExecutionStrategy {
    /// Case-insensitive parse of `PARALLEL` / `SERIAL`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PARALLEL" => Some(Self::Parallel),
            "SERIAL" => Some(Self::Serial),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => write!(f, "PARALLEL"),
            Self::Serial => write!(f, "SERIAL"),
        }
    }
}

/// Iteration state persisted on the Repeat instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RepeatStateData {
    pub elements: Vec<Value>,
    pub strategy: ExecutionStrategy,
    /// Position of the active child (SERIAL only)
    #[serde(default)]
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct RepeatState {
    elements: String,
    element_type: ElementType,
    strategy: Option<ExecutionStrategy>,
    strategy_expression: Option<String>,
    target: Option<String>,
}

impl RepeatState {
    /// Repeats over the value of `elements`, an expression or JSON literal.
    pub fn new(elements: impl Into<String>) -> Self {
        Self {
            elements: elements.into(),
            element_type: ElementType::RepeatElement,
            strategy: None,
            strategy_expression: None,
            target: None,
        }
    }

    pub fn with_element_type(mut self, element_type: ElementType) -> Self {
        self.element_type = element_type;
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Strategy chosen at dispatch time; ignored when a static strategy is set.
    pub fn with_strategy_expression(mut self, expression: impl Into<String>) -> Self {
        self.strategy_expression = Some(expression.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    fn resolve_strategy(&self, ctx: &ExecutionContext<'_>) -> ExecutionStrategy {
        if let Some(strategy) = self.strategy {
            return strategy;
        }

        let Some(expression) = &self.strategy_expression else {
            return ExecutionStrategy::Serial;
        };

        match ctx.evaluate(expression) {
            Ok(Value::String(s)) => ExecutionStrategy::parse(&s).unwrap_or_else(|| {
                warn!("Unknown repeat strategy '{}'; using SERIAL", s);
                ExecutionStrategy::Serial
            }),
            Ok(other) => {
                warn!("Repeat strategy evaluated to {}; using SERIAL", other);
                ExecutionStrategy::Serial
            }
            Err(e) => {
                warn!("Could not resolve repeat strategy: {}; using SERIAL", e);
                ExecutionStrategy::Serial
            }
        }
    }

    fn spawn(&self, parent: &ExecutionInstance, target: &str, element: &Value) -> ExecutionInstance {
        ChildInstanceBuilder::new(parent, target)
            .with_element(ContextElement::from_value(self.element_type.clone(), element.clone()))
            .build()
    }

    fn target_of(&self, ctx: &ExecutionContext<'_>) -> Result<String, StateError> {
        self.target
            .clone()
            .ok_or_else(|| StateError::MissingTransition(ctx.instance().state_name.clone()))
    }
}

impl State for RepeatState {
    fn kind(&self) -> &'static str {
        "repeat"
    }

    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
        let parent = ctx.instance();
        let target = self.target_of(ctx)?;

        let elements = match ctx.evaluate(&self.elements)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single => vec![single],
        };
        if elements.is_empty() {
            return Err(StateError::NoRepeatElements(parent.state_name.clone()));
        }

        let strategy = self.resolve_strategy(ctx);
        info!(
            "Repeat '{}' over {} element(s), {}",
            parent.state_name,
            elements.len(),
            strategy
        );

        let children = match strategy {
            ExecutionStrategy::Parallel => elements
                .iter()
                .map(|element| self.spawn(parent, &target, element))
                .collect(),
            ExecutionStrategy::Serial => vec![self.spawn(parent, &target, &elements[0])],
        };

        let data = RepeatStateData {
            elements,
            strategy,
            index: 0,
        };

        Ok(SpawningExecutionResponse::new(children)
            .with_execution_data(serde_json::to_value(&data)?)
            .into())
    }

    fn resume(
        &self,
        ctx: &ExecutionContext<'_>,
        results: &HashMap<String, NotifyResult>,
    ) -> Result<StateResponse, StateError> {
        let mut data: RepeatStateData = ctx.state_data()?;

        if data.strategy == ExecutionStrategy::Parallel {
            let mut response = ExecutionResponse::completed(aggregate_status(results));
            if response.status != ExecutionStatus::Success {
                response.error_message = results
                    .values()
                    .filter(|r| r.status != ExecutionStatus::Success)
                    .find_map(|r| r.error_message.clone());
            }
            return Ok(response.into());
        }

        let status = match results.values().next() {
            Some(result) if results.len() == 1 => finished_status(result.status),
            _ => aggregate_status(results),
        };
        let last = data.elements.len().saturating_sub(1);

        if status != ExecutionStatus::Success || data.index >= last {
            debug!(
                "Repeat '{}' finished at index {} with {}",
                ctx.instance().state_name,
                data.index,
                status
            );
            let mut response = ExecutionResponse::completed(status)
                .with_output(json!({ "completed": data.index + 1, "total": data.elements.len() }));
            if status != ExecutionStatus::Success {
                response.error_message = results.values().find_map(|r| r.error_message.clone());
            }
            return Ok(response.into());
        }

        data.index += 1;
        let target = self.target_of(ctx)?;
        let child = self.spawn(ctx.instance(), &target, &data.elements[data.index]);
        debug!(
            "Repeat '{}' advancing to index {}",
            ctx.instance().state_name,
            data.index
        );

        Ok(SpawningExecutionResponse::new(vec![child])
            .with_execution_data(serde_json::to_value(&data)?)
            .into())
    }
}

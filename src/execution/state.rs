//! State Contract
//!
//! A state is one unit of workflow work. The engine calls `execute` once per
//! fresh dispatch of an instance and `resume` whenever a wait-set the state
//! suspended on completes. States never block on external events: they
//! return an asynchronous response and get resumed later, possibly in a
//! different process.
//!
//! States hold only their configuration. Anything that must survive a
//! suspension goes into the response's execution data, which the engine
//! persists on the instance and hands back through the context.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::context::{ContextStack, ExpressionError, ExpressionEvaluator};
use crate::notify::NotifyEngine;
use crate::schedule::Scheduler;

use super::instance::{ExecutionInstance, ExecutionStatus};
use super::response::{aggregate_status, ExecutionResponse, NotifyResult, StateResponse};

/// Failure inside a state's `execute` or `resume`.
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("state '{0}' has no elements to repeat over")]
    NoRepeatElements(String),

    #[error("state '{0}' has no transition target")]
    MissingTransition(String),

    #[error("invalid execution data: {0}")]
    InvalidData(#[from] serde_json::Error),

    #[error("task dispatch failed: {0}")]
    Dispatch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl StateError {
    /// Structurally invalid definitions; retrying cannot fix them.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::NoRepeatElements(_) | Self::MissingTransition(_))
    }

    /// The terminal status the engine records for this error.
    pub fn terminal_status(&self) -> ExecutionStatus {
        if self.is_configuration() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Error
        }
    }
}

/// Everything a state may use while executing one instance.
pub struct ExecutionContext<'a> {
    instance: &'a ExecutionInstance,
    evaluator: &'a dyn ExpressionEvaluator,
    notify: &'a Arc<NotifyEngine>,
    scheduler: &'a Arc<dyn Scheduler>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        instance: &'a ExecutionInstance,
        evaluator: &'a dyn ExpressionEvaluator,
        notify: &'a Arc<NotifyEngine>,
        scheduler: &'a Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            instance,
            evaluator,
            notify,
            scheduler,
        }
    }

    pub fn instance(&self) -> &ExecutionInstance {
        self.instance
    }

    pub fn elements(&self) -> &ContextStack {
        &self.instance.context_elements
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.evaluator
    }

    pub fn notify_engine(&self) -> &Arc<NotifyEngine> {
        self.notify
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        self.scheduler
    }

    /// Evaluates an expression against this instance's context.
    pub fn evaluate(&self, expression: &str) -> Result<serde_json::Value, ExpressionError> {
        self.evaluator.evaluate(expression, self.elements())
    }

    /// Decodes the state data persisted on the instance.
    pub fn state_data<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        Ok(serde_json::from_value(self.instance.state_data.clone())?)
    }
}

/// One unit of workflow work.
pub trait State: Send + Sync {
    /// Short name of the state variant, used in logs.
    fn kind(&self) -> &'static str;

    /// Runs the state for a freshly dispatched instance.
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError>;

    /// Continues after every correlation id of the wait-set reported.
    fn resume(
        &self,
        _ctx: &ExecutionContext<'_>,
        results: &HashMap<String, NotifyResult>,
    ) -> Result<StateResponse, StateError> {
        Ok(propagate_results(results).into())
    }

    /// Best-effort cleanup when the instance is aborted.
    fn handle_abort(&self, _ctx: &ExecutionContext<'_>) {}

    /// Re-arms in-process triggers (timers) for an instance found suspended
    /// after a restart. The wait itself is re-registered by the engine.
    fn recover(&self, _ctx: &ExecutionContext<'_>) -> Result<(), StateError> {
        Ok(())
    }
}

/// Maps a delivered status onto a terminal one.
pub fn finished_status(status: ExecutionStatus) -> ExecutionStatus {
    if status.is_finished_outcome() {
        status
    } else {
        ExecutionStatus::Failed
    }
}

/// Default resume: a single result's status, data and error pass through;
/// several results reduce to SUCCESS only if all succeeded.
pub fn propagate_results(results: &HashMap<String, NotifyResult>) -> ExecutionResponse {
    if results.len() == 1 {
        if let Some(result) = results.values().next() {
            let mut response = ExecutionResponse::completed(finished_status(result.status))
                .with_output(result.data.clone());
            response.error_message = result.error_message.clone();
            return response;
        }
    }

    ExecutionResponse::completed(aggregate_status(results))
}

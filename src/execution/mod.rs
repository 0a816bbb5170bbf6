//! Workflow Execution Module
//!
//! Runs execution instances through their states, suspending them on
//! correlation ids and resuming them when results arrive.
//!
//! # Architecture
//!
//! - [`instance`]: The persisted run record and its status machine
//! - [`response`]: What states return and how results aggregate
//! - [`state`]: The state contract and its execution context
//! - [`store`]: Instance persistence
//! - [`dispatch`]: Where engine jobs run
//! - [`engine`]: Main engine orchestrating dispatch, resume and abort

pub mod dispatch;
pub mod engine;
pub mod instance;
pub mod response;
pub mod state;
pub mod store;

pub use dispatch::{Dispatcher, InlineDispatcher, Job, WorkerPool};
pub use engine::{Engine, EngineError, EngineServices, ExecutionOutcome, RecoveryReport};
pub use instance::{ChildInstanceBuilder, ExecutionInstance, ExecutionStatus, InvalidTransition};
pub use response::{
    aggregate_status, ExecutionResponse, NotifyResult, ProtocolViolation, SpawningExecutionResponse,
    StateResponse,
};
pub use state::{finished_status, propagate_results, ExecutionContext, State, StateError};
pub use store::{FileStore, InstanceStore, MemoryStore, StoreError};

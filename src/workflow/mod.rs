//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and compiling state-machine workflows.
//!
//! # Structure
//!
//! - [`model`]: Serializable definitions (WorkflowDefinition, StateDefinition)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules and cycle detection
//! - [`graph`]: The executable StateGraph
//! - [`factory`]: Definition to graph compilation

pub mod factory;
pub mod graph;
pub mod model;
pub mod parser;
pub mod validator;

pub use factory::{FactoryError, StateFactory};
pub use graph::{StateGraph, StateGraphBuilder, StateNode};
pub use model::{StateDefinition, StateKind, WorkflowDefinition};
pub use parser::{load_workflow, parse_duration, parse_workflow, ParseError};
pub use validator::{validate_definition, ValidationError, ValidationErrors};

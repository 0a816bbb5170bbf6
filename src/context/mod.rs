//! Execution Context Module
//!
//! Data attached to an execution instance and the capability used to
//! evaluate expressions against it.
//!
//! - [`element`]: Context elements and the element stack
//! - [`evaluator`]: Expression evaluation over a stack

pub mod element;
pub mod evaluator;

pub use element::{ContextElement, ContextStack, ElementType};
pub use evaluator::{ContextEvaluator, ExpressionError, ExpressionEvaluator};

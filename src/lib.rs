//! Stateflow - Resumable Workflow State-Machine Engine
//!
//! Runs deployment workflows as graphs of states. A state either finishes
//! right away or suspends on correlation ids and is resumed once every one
//! of them has reported, possibly after a process restart. Control states
//! fan work out to child instances and aggregate their results.
//!
//! # Architecture
//!
//! - [`context`]: Typed context elements and expression evaluation
//! - [`execution`]: Instances, the state contract, persistence and the engine
//! - [`notify`]: The notify/wait correlation engine
//! - [`schedule`]: Timers for wait states
//! - [`states`]: Fork, Repeat, Wait, Task and Shell states
//! - [`workflow`]: YAML definitions, validation and compiled state graphs
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine settings with environment overrides
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stateflow::{load_workflow, Engine, EngineServices, StateFactory};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load and compile a workflow
//!     let definition = load_workflow("rollout.yaml")?;
//!     let graph = StateFactory::new().build(&definition)?;
//!
//!     // Run it to completion
//!     let engine = Engine::new(EngineServices::in_memory());
//!     engine.register_workflow(graph);
//!     let execution_id = engine.start("rollout", Vec::new())?;
//!     let outcome = engine.wait_for_outcome(&execution_id, Duration::from_secs(600))?;
//!
//!     println!("{}", outcome.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod execution;
pub mod monitoring;
pub mod notify;
pub mod schedule;
pub mod states;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use context::{ContextElement, ElementType};
pub use execution::{Engine, EngineServices, ExecutionStatus, NotifyResult};
pub use notify::NotifyEngine;
pub use workflow::{load_workflow, StateFactory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "stateflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "stateflow");
    }

    #[test]
    fn test_module_exports_run_a_workflow() {
        let definition = workflow::parse_workflow(
            r#"
name: hello
states:
  - name: greet
    type: shell
    script: echo hello
"#,
        )
        .unwrap();
        let graph = StateFactory::new().build(&definition).unwrap();

        let engine = Engine::new(EngineServices::in_memory());
        engine.register_workflow(graph);
        let execution_id = engine.start("hello", Vec::new()).unwrap();

        let outcome = engine.outcome(&execution_id).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}

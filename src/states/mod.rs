//! Built-in States
//!
//! Control states that structure a workflow, plus two leaf states.
//!
//! - [`fork`]: fixed set of children, all at once
//! - [`repeat`]: one child per element of a dynamic collection, serial or parallel
//! - [`wait`]: timer-backed suspension
//! - [`task`]: work handed to a remote agent
//! - [`shell`]: a bash script run in-process

pub mod fork;
pub mod repeat;
pub mod shell;
pub mod task;
pub mod wait;

pub use fork::ForkState;
pub use repeat::{ExecutionStrategy, RepeatState, RepeatStateData};
pub use shell::ShellState;
pub use task::{TaskDispatcher, TaskRequest, TaskState};
pub use wait::{WaitState, WaitStateData};

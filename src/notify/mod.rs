//! Notify/Wait Module
//!
//! Decouples who is waiting from who completes the wait. States suspend by
//! declaring correlation ids; timers, remote task callbacks and finished
//! child lineages report results against those ids.
//!
//! - [`registry`]: The shared, thread-safe [`NotifyEngine`]

pub mod registry;

pub use registry::{NotifyEngine, NotifyError, NotifyOutcome, WaitCallback};

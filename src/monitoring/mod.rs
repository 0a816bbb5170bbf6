//! Monitoring Module
//!
//! Records the lifecycle of execution instances during an engine run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Per-instance start/suspend/end events and reports

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};

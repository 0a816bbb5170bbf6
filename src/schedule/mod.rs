//! Delayed Callback Scheduling
//!
//! The Wait state suspends by asking a [`Scheduler`] to run a callback
//! after a delay. Hosts choose the implementation:
//!
//! - [`ThreadScheduler`]: one sleeping thread per timer
//! - [`TokioScheduler`]: timers as tasks on a tokio runtime
//! - [`ManualScheduler`]: a virtual clock advanced explicitly (tests, simulation)

pub mod manual;

use std::thread;
use std::time::Duration;

use log::{debug, error};
use tokio::runtime::Handle;

pub use manual::ManualScheduler;

/// Work to run once a delay has elapsed.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask);
}

/// Sleeps on a dedicated thread per scheduled task.
#[derive(Debug, Clone, Default)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) {
        debug!("Scheduling thread timer in {:?}", delay);
        let spawned = thread::Builder::new()
            .name("stateflow-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                task();
            });

        if let Err(e) = spawned {
            error!("Failed to spawn timer thread: {}", e);
        }
    }
}

/// Schedules tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) {
        debug!("Scheduling tokio timer in {:?}", delay);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // Callbacks may block (they resume workflows); keep them off the reactor.
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                error!("Timer callback panicked: {}", e);
            }
        });
    }
}

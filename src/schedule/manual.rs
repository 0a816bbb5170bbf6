//! Virtual Clock Scheduler
//!
//! Tasks fire only when [`ManualScheduler::advance`] moves the clock past
//! their deadline, in deadline order. Tasks are run outside the internal
//! lock so they may schedule further tasks.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use super::{ScheduledTask, Scheduler};

struct Pending {
    due: Duration,
    sequence: u64,
    task: ScheduledTask,
}

#[derive(Default)]
struct Clock {
    now: Duration,
    next_sequence: u64,
    pending: Vec<Pending>,
}

/// Scheduler driven by an explicit virtual clock.
#[derive(Default)]
pub struct ManualScheduler {
    clock: Mutex<Clock>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current virtual time since creation.
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of tasks not yet fired.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Moves the clock forward and runs every task that became due.
    ///
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().now + by;
        let mut fired = 0;

        loop {
            let next = {
                let mut clock = self.lock();
                let position = clock
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.due <= target)
                    .min_by_key(|(_, p)| (p.due, p.sequence))
                    .map(|(i, _)| i);

                match position {
                    Some(i) => {
                        let pending = clock.pending.remove(i);
                        clock.now = pending.due;
                        Some(pending.task)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };

            match next {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => break,
            }
        }

        debug!("Virtual clock advanced by {:?}; {} task(s) fired", by, fired);
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) {
        let mut clock = self.lock();
        let due = clock.now + delay;
        let sequence = clock.next_sequence;
        clock.next_sequence += 1;
        clock.pending.push(Pending { due, sequence, task });
    }
}

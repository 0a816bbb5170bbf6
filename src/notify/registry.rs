//! Notify/Wait Registry
//!
//! Maps correlation ids to the waiters suspended on them and delivers each
//! completed wait-set exactly once.
//!
//! All tables live behind one mutex. The "every expected id has a result"
//! check and the removal of the waiter happen under that lock, so two
//! concurrent notifies for the last two ids of a wait-set can never both
//! see it complete. Callbacks run only after the lock is released.
//!
//! Notified and cancelled ids are remembered in bounded, oldest-first
//! tables ([`DEFAULT_RETENTION`] each). Once an id ages out, a repeated
//! notify for it is no longer rejected or discarded but buffered like any
//! unknown id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use thiserror::Error;

use crate::execution::NotifyResult;

/// Invoked once with the waiter id and the full result map.
pub type WaitCallback = Box<dyn FnOnce(String, HashMap<String, NotifyResult>) + Send>;

/// Misuse of the notify/wait protocol.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NotifyError {
    #[error("waiter '{0}' is already registered")]
    DuplicateWaiter(String),

    #[error("waiter '{0}' registered an empty wait-set")]
    EmptyWaitSet(String),

    #[error("correlation id '{0}' was already notified")]
    AlreadyNotified(String),
}

/// What happened to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Stored for at least one waiter; `resumed` of them completed
    Delivered { resumed: usize },
    /// No waiter yet; kept until one registers for the id
    Buffered,
    /// The id belongs to a cancelled wait and was dropped
    Discarded,
}

struct Waiter {
    expected: HashSet<String>,
    received: HashMap<String, NotifyResult>,
    callback: WaitCallback,
}

impl Waiter {
    fn is_complete(&self) -> bool {
        self.expected.len() == self.received.len()
    }
}

/// How many notified and cancelled ids are remembered by default.
pub const DEFAULT_RETENTION: usize = 65_536;

/// Set of ids that forgets its oldest entries beyond `capacity`.
struct Retained {
    capacity: usize,
    members: HashMap<String, u64>,
    order: VecDeque<(String, u64)>,
    next: u64,
}

impl Retained {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            members: HashMap::new(),
            order: VecDeque::new(),
            next: 0,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.members.contains_key(id) {
            return false;
        }

        let generation = self.next;
        self.next += 1;
        self.members.insert(id.to_string(), generation);
        self.order.push_back((id.to_string(), generation));

        while self.order.len() > self.capacity {
            if let Some((old, old_generation)) = self.order.pop_front() {
                // Skip entries that were removed and inserted again since.
                if self.members.get(&old) == Some(&old_generation) {
                    self.members.remove(&old);
                }
            }
        }
        true
    }

    fn remove(&mut self, id: &str) {
        self.members.remove(id);
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

struct Tables {
    waiters: HashMap<String, Waiter>,
    correlations: HashMap<String, Vec<String>>,
    early: HashMap<String, NotifyResult>,
    notified: Retained,
    cancelled: Retained,
}

impl Tables {
    fn new(retention: usize) -> Self {
        Self {
            waiters: HashMap::new(),
            correlations: HashMap::new(),
            early: HashMap::new(),
            notified: Retained::new(retention),
            cancelled: Retained::new(retention),
        }
    }
}

/// Process-wide registry matching completions to waiters.
///
/// Constructed once by the host and shared by handle with the engine,
/// the schedulers and any remote task callbacks.
pub struct NotifyEngine {
    tables: Mutex<Tables>,
}

impl Default for NotifyEngine {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl NotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers at most `retention` notified and `retention` cancelled ids.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::new(retention)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `waiter_id` as waiting on every id in `correlation_ids`.
    ///
    /// Results that arrived before registration are matched immediately;
    /// if they already cover the whole wait-set the callback runs before
    /// this returns.
    pub fn register_wait(
        &self,
        waiter_id: &str,
        correlation_ids: &[String],
        callback: WaitCallback,
    ) -> Result<(), NotifyError> {
        if correlation_ids.is_empty() {
            return Err(NotifyError::EmptyWaitSet(waiter_id.to_string()));
        }

        let completed = {
            let mut tables = self.lock();
            if tables.waiters.contains_key(waiter_id) {
                return Err(NotifyError::DuplicateWaiter(waiter_id.to_string()));
            }

            let expected: HashSet<String> = correlation_ids.iter().cloned().collect();
            let mut received = HashMap::new();
            for id in &expected {
                tables.cancelled.remove(id);
                if let Some(result) = tables.early.remove(id) {
                    debug!("Matched early result for '{}' to waiter '{}'", id, waiter_id);
                    received.insert(id.clone(), result);
                }
            }

            let waiter = Waiter {
                expected,
                received,
                callback,
            };

            if waiter.is_complete() {
                Some(waiter)
            } else {
                for id in &waiter.expected {
                    if !waiter.received.contains_key(id) {
                        tables
                            .correlations
                            .entry(id.clone())
                            .or_default()
                            .push(waiter_id.to_string());
                    }
                }
                tables.waiters.insert(waiter_id.to_string(), waiter);
                None
            }
        };

        debug!(
            "Registered waiter '{}' on {} correlation id(s)",
            waiter_id,
            correlation_ids.len()
        );

        if let Some(waiter) = completed {
            info!("Wait-set of '{}' already complete at registration", waiter_id);
            (waiter.callback)(waiter_id.to_string(), waiter.received);
        }

        Ok(())
    }

    /// Delivers the result for one correlation id.
    ///
    /// Each correlation id is single-use: a second notify for the same id is
    /// an error, unless its wait was cancelled, in which case the call is
    /// discarded.
    pub fn notify(&self, correlation_id: &str, result: NotifyResult) -> Result<NotifyOutcome, NotifyError> {
        let mut ready = Vec::new();

        let outcome = {
            let mut tables = self.lock();

            if tables.cancelled.contains(correlation_id) {
                debug!("Discarding late result for cancelled correlation id '{}'", correlation_id);
                return Ok(NotifyOutcome::Discarded);
            }

            if !tables.notified.insert(correlation_id) {
                warn!("Correlation id '{}' notified twice", correlation_id);
                return Err(NotifyError::AlreadyNotified(correlation_id.to_string()));
            }

            match tables.correlations.remove(correlation_id) {
                None => {
                    debug!("No waiter yet for '{}'; buffering result", correlation_id);
                    tables.early.insert(correlation_id.to_string(), result);
                    NotifyOutcome::Buffered
                }
                Some(waiter_ids) => {
                    for waiter_id in waiter_ids {
                        let complete = match tables.waiters.get_mut(&waiter_id) {
                            Some(waiter) => {
                                waiter.received.insert(correlation_id.to_string(), result.clone());
                                waiter.is_complete()
                            }
                            None => false,
                        };
                        if complete {
                            if let Some(waiter) = tables.waiters.remove(&waiter_id) {
                                ready.push((waiter_id, waiter));
                            }
                        }
                    }
                    NotifyOutcome::Delivered { resumed: ready.len() }
                }
            }
        };

        for (waiter_id, waiter) in ready {
            info!("Wait-set of '{}' complete; resuming", waiter_id);
            (waiter.callback)(waiter_id, waiter.received);
        }

        Ok(outcome)
    }

    /// Removes a waiter and cancels every id of its wait-set.
    ///
    /// Returns the ids that had not reported yet, or `None` if the waiter
    /// was not registered. Later notifies for any of its ids are discarded.
    pub fn cancel_wait(&self, waiter_id: &str) -> Option<Vec<String>> {
        let mut tables = self.lock();
        let waiter = tables.waiters.remove(waiter_id)?;

        let mut outstanding = Vec::new();
        for id in &waiter.expected {
            if let Some(waiters) = tables.correlations.get_mut(id) {
                waiters.retain(|w| w != waiter_id);
                if waiters.is_empty() {
                    tables.correlations.remove(id);
                }
            }
            if !waiter.received.contains_key(id) {
                outstanding.push(id.clone());
            }
            tables.cancelled.insert(id);
        }

        outstanding.sort();
        info!(
            "Cancelled waiter '{}' ({} outstanding correlation id(s))",
            waiter_id,
            outstanding.len()
        );
        Some(outstanding)
    }

    /// Marks correlation ids as cancelled without a registered waiter.
    pub fn discard(&self, correlation_ids: &[String]) {
        let mut tables = self.lock();
        for id in correlation_ids {
            tables.early.remove(id);
            tables.cancelled.insert(id);
        }
    }

    /// Returns true if the id belongs to a cancelled wait.
    pub fn is_cancelled(&self, correlation_id: &str) -> bool {
        self.lock().cancelled.contains(correlation_id)
    }

    /// Number of notified and cancelled ids currently remembered.
    pub fn retained(&self) -> (usize, usize) {
        let tables = self.lock();
        (tables.notified.len(), tables.cancelled.len())
    }

    pub fn is_waiting(&self, waiter_id: &str) -> bool {
        self.lock().waiters.contains_key(waiter_id)
    }

    /// Ids of every registered waiter, sorted.
    pub fn pending_waiters(&self) -> Vec<String> {
        let mut waiters: Vec<String> = self.lock().waiters.keys().cloned().collect();
        waiters.sort();
        waiters
    }

    /// Ids a waiter still expects, sorted.
    pub fn outstanding(&self, waiter_id: &str) -> Option<Vec<String>> {
        let tables = self.lock();
        let waiter = tables.waiters.get(waiter_id)?;
        let mut ids: Vec<String> = waiter
            .expected
            .iter()
            .filter(|id| !waiter.received.contains_key(*id))
            .cloned()
            .collect();
        ids.sort();
        Some(ids)
    }
}

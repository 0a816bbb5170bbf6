//! Engine Configuration
//!
//! Host-level settings with environment overrides:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `STATEFLOW_WORKERS` | dispatcher threads | number of CPUs |
//! | `STATEFLOW_HOME` | directory for persisted instances | `.stateflow` |
//! | `STATEFLOW_PERSIST` | `1`/`true` keeps instances on disk | off |

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::execution::{EngineServices, FileStore, InstanceStore, MemoryStore, StoreError, WorkerPool};
use crate::schedule::Scheduler;

/// State directory, resolved once from `STATEFLOW_HOME`.
pub static STATEFLOW_HOME: Lazy<PathBuf> = Lazy::new(|| {
    env::var_os("STATEFLOW_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".stateflow"))
});

/// Settings for building an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads running engine jobs
    pub workers: usize,
    /// Root of the file store
    pub store_dir: PathBuf,
    /// Persist instances to `store_dir` instead of memory
    pub persist: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

impl EngineConfig {
    /// Builds a config from a variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workers = match lookup("STATEFLOW_WORKERS") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!("Ignoring invalid STATEFLOW_WORKERS value '{}'", value);
                    num_cpus::get()
                }
            },
            None => num_cpus::get(),
        };

        let persist = lookup("STATEFLOW_PERSIST")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"))
            .unwrap_or(false);

        Self {
            workers,
            store_dir: STATEFLOW_HOME.clone(),
            persist,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Directory holding one JSON file per instance.
    pub fn instances_dir(&self) -> PathBuf {
        self.store_dir.join("instances")
    }

    /// Store, worker pool and timers for an engine.
    pub fn services(&self, scheduler: Arc<dyn Scheduler>) -> Result<EngineServices, StoreError> {
        let store: Arc<dyn InstanceStore> = if self.persist {
            Arc::new(FileStore::open(self.instances_dir())?)
        } else {
            debug!("Keeping instances in memory");
            Arc::new(MemoryStore::new())
        };

        Ok(EngineServices::new(store, scheduler, Arc::new(WorkerPool::new(self.workers))))
    }
}

//! Instance Persistence
//!
//! Saves execution instances so suspended work survives a restart. Every
//! piece of state needed to resume (context stack, wait-set, Repeat index,
//! Fork bookkeeping) is part of the instance record itself.
//!
//! - [`MemoryStore`]: in-process map, lost on exit
//! - [`FileStore`]: one JSON file per instance under a directory

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use thiserror::Error;

use super::instance::ExecutionInstance;

/// Failure to load or save an instance.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt instance record '{path}': {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Load/save of execution instances by id.
pub trait InstanceStore: Send + Sync {
    fn save(&self, instance: &ExecutionInstance) -> Result<(), StoreError>;

    fn load(&self, id: &str) -> Result<Option<ExecutionInstance>, StoreError>;

    /// Every instance of the lineage identified by `notify_id`.
    fn find_by_notify_id(&self, notify_id: &str) -> Result<Vec<ExecutionInstance>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.notify_id.as_deref() == Some(notify_id))
            .collect())
    }

    fn list(&self) -> Result<Vec<ExecutionInstance>, StoreError>;
}

/// Keeps instances in memory.
#[derive(Default)]
pub struct MemoryStore {
    instances: Mutex<HashMap<String, ExecutionInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ExecutionInstance>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl InstanceStore for MemoryStore {
    fn save(&self, instance: &ExecutionInstance) -> Result<(), StoreError> {
        self.lock().insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<ExecutionInstance>, StoreError> {
        Ok(self.lock().get(id).cloned())
    }

    fn find_by_notify_id(&self, notify_id: &str) -> Result<Vec<ExecutionInstance>, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|i| i.notify_id.as_deref() == Some(notify_id))
            .cloned()
            .collect())
    }

    fn list(&self) -> Result<Vec<ExecutionInstance>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }
}

/// Stores each instance as `{dir}/{instance_id}.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        info!("Instance store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn instance_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(path: &Path) -> Result<ExecutionInstance, StoreError> {
        let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Serialization {
            path: path.display().to_string(),
            source,
        })
    }

    /// Deletes an instance record. Missing records are not an error.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.instance_path(id);
        if path.exists() {
            fs::remove_file(&path).map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
            debug!("Deleted instance record: {}", path.display());
        }
        Ok(())
    }
}

impl InstanceStore for FileStore {
    fn save(&self, instance: &ExecutionInstance) -> Result<(), StoreError> {
        let path = self.instance_path(&instance.id);
        let json = serde_json::to_string_pretty(instance).map_err(|source| StoreError::Serialization {
            path: path.display().to_string(),
            source,
        })?;

        // Write-then-rename so a crash never leaves a half-written record.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;

        debug!("Saved instance {} ({})", instance.id, instance.status());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<ExecutionInstance>, StoreError> {
        let path = self.instance_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<ExecutionInstance>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut instances = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Skipping unreadable instance record: {}", e),
            }
        }
        Ok(instances)
    }
}

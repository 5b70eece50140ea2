//! Key-value storage used for identifiers and autosave sessions
//!
//! Every operation is fallible. Callers in this crate treat any error as
//! "storage unavailable" and degrade instead of failing.
//!
//! Backends:
//! - [`SqliteStore`]: durable store that survives restarts (persistent storage)
//! - [`MemoryStore`]: process-scoped map (session-scoped storage)
//! - [`UnavailableStore`]: rejects everything, for hosts where storage is disabled

pub mod schema;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

pub use sqlite::SqliteStore;

/// Minimal key-value contract shared by all storage backends
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Key written and removed by [`probe`]
pub const PROBE_KEY: &str = "dealpulse.__storage_probe__";

/// Check that a store accepts a write and a remove
pub fn probe(store: &dyn KeyValueStore) -> bool {
    let result = store
        .set(PROBE_KEY, "1")
        .and_then(|()| store.remove(PROBE_KEY));
    if let Err(e) = &result {
        tracing::debug!(error = %e, "storage probe failed");
    }
    result.is_ok()
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| Error::Storage(format!("memory store poisoned: {}", e)))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| Error::Storage(format!("memory store poisoned: {}", e)))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| Error::Storage(format!("memory store poisoned: {}", e)))?;
        entries.remove(key);
        Ok(())
    }
}

/// Store that rejects every operation
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl KeyValueStore for UnavailableStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::StorageUnavailable)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::StorageUnavailable)
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(Error::StorageUnavailable)
    }
}

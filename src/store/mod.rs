// src/store/mod.rs

//! Durable key/value state
//!
//! Sync state and rate-limit records are small JSON documents stored
//! behind [`KvStore`]. The trait's `update` is an atomic read-modify-write,
//! which is what keeps the rate limiter and the check timestamp correct
//! when several processes serve requests at once.
//!
//! - [`SqliteStore`]: file-backed, safe across processes
//! - [`MemoryStore`]: process-local, used by tests and embedders

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Key/value persistence with atomic read-modify-write
pub trait KvStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value; missing keys are not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Atomically transform a value
    ///
    /// `f` receives the current value and returns the new one; `None`
    /// deletes the key. No other writer can interleave between the read
    /// and the write. If `f` fails nothing is written.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        match f(entries.get(key).cloned())? {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(())
    }
}

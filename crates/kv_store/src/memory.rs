//! In-memory key/value store.
//!
//! `MemoryKvStore` keeps every entry in a `HashMap` behind an `RwLock`. It is
//! used by tests and by hosts that have no durable local storage. An optional
//! byte quota makes it behave like a browser-style storage area that rejects
//! writes once full.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{KeyValueStore, KvError, KvResult};

/// In-memory implementation of `KeyValueStore`
///
/// Share it across owners with `Arc`; two components holding the same `Arc`
/// observe each other's writes, which is how tests simulate an app restart
/// over the same durable storage.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
    /// Maximum total bytes (keys + values), `None` for unlimited
    quota_bytes: Option<usize>,
}

impl MemoryKvStore {
    /// Create an empty store with no quota
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that rejects writes beyond `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn size_of(entries: &HashMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let entries = self.entries.read().map_err(|_| KvError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        let mut entries = self.entries.write().map_err(|_| KvError::Poisoned)?;

        if let Some(limit) = self.quota_bytes {
            let replaced = entries.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
            let needed = Self::size_of(&entries) - replaced + key.len() + value.len();
            if needed > limit {
                return Err(KvError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    limit,
                });
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> KvResult<()> {
        let mut entries = self.entries.write().map_err(|_| KvError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> KvResult<Vec<String>> {
        let entries = self.entries.read().map_err(|_| KvError::Poisoned)?;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

//! Durable key/value storage for local session state.
//!
//! This crate defines the `KeyValueStore` trait, the minimal synchronous
//! string store the exam runtime persists into, together with two backends:
//!
//! - `memory`: `MemoryKvStore`, an in-process store with an optional byte quota
//! - `file`: `FileKvStore`, one file per key under a base directory
//!
//! # Example
//!
//! ```
//! use kv_store::{KeyValueStore, MemoryKvStore};
//!
//! let store = MemoryKvStore::new();
//! store.set("session-state:abc", "{}").unwrap();
//! assert_eq!(store.get("session-state:abc").unwrap().as_deref(), Some("{}"));
//! ```

mod error;
pub mod file;
pub mod memory;

pub use error::{KvError, KvResult};
pub use file::FileKvStore;
pub use memory::MemoryKvStore;

/// Synchronous string key/value store
///
/// Methods take `&self` so a single store can be shared across sessions
/// behind an `Arc`; implementations use interior locking. Keys are opaque
/// strings and callers partition the namespace by prefix.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, or `None` if absent
    fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    ///
    /// The write is atomic: readers observe either the old or the new value.
    fn set(&self, key: &str, value: &str) -> KvResult<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> KvResult<()>;

    /// List every key currently stored
    fn keys(&self) -> KvResult<Vec<String>>;

    /// Check whether `key` is present
    fn contains(&self, key: &str) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

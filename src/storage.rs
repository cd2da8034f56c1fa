//! Key/value backends for mirroring cache entries outside process memory.

use crate::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// A string key/value store in the style of the browser's `localStorage`.
///
/// Implementations must be cheap to call; the cache calls them while
/// handling every `set`, `delete` and memory miss.
pub trait Storage: Send + Sync {
    /// Returns the value stored under `key`.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key` if present.
    fn remove_item(&self, key: &str);

    /// Removes every key.
    fn clear(&self);

    /// Number of stored keys.
    fn len(&self) -> usize;

    /// Returns `true` when nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the key at `index` in the backend's iteration order.
    fn key(&self, index: usize) -> Option<String>;
}

/// In-memory [`Storage`], ordered by key.
///
/// # Examples
///
/// ```
/// use querykit::storage::{MemoryStorage, Storage};
///
/// let storage = MemoryStorage::new();
/// storage.set_item("a", "1").unwrap();
/// assert_eq!(storage.get_item("a").as_deref(), Some("1"));
/// assert_eq!(storage.key(0).as_deref(), Some("a"));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        self.items.lock().remove(key);
    }

    fn clear(&self) {
        self.items.lock().clear();
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.items.lock().keys().nth(index).cloned()
    }
}

//! Tracks pushes to the local registry that are currently running.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};


/// A set of keys for in-progress local pushes.
///
/// At most one holder per key; a second `acquire` for the same key fails
/// until the first holder releases it.
#[derive(Debug, Default)]
pub struct InflightSet {
    keys: Mutex<HashSet<String>>,
}

impl InflightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key`. Returns false if it is already registered.
    pub fn acquire(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.insert(key.to_string())
    }

    pub fn release(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.contains(key)
    }

    /// Acquires `key` and returns a guard that releases it on drop.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::inflight::InflightSet;
    /// use std::sync::Arc;
    ///
    /// let set = Arc::new(InflightSet::new());
    /// let guard = InflightSet::guard(&set, "library/hello:latest").unwrap();
    /// assert!(InflightSet::guard(&set, "library/hello:latest").is_none());
    /// drop(guard);
    /// assert!(!set.contains("library/hello:latest"));
    /// ```
    pub fn guard(set: &Arc<Self>, key: &str) -> Option<InflightGuard> {
        set.acquire(key).then(|| InflightGuard {
            set: set.clone(),
            key: key.to_string(),
        })
    }
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct InflightGuard {
    set: Arc<InflightSet>,
    key: String,
}

impl InflightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

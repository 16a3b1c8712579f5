//! Size-bounded LRU accounting for content admitted to local storage.
//!
//! [`LruTracker`] only does the bookkeeping; it does not own the disk. When
//! it evicts a digest it hands it to a callback that must not block. The
//! usual callback is [`channel_callback`], which queues the digest for
//! [`run_eviction_worker`] to delete from the [`LocalStore`].

use crate::error::{DepotError, Result};
use crate::local::LocalStore;
use chrono::{DateTime, Utc};
use humansize::{BINARY, format_size};
use lru::LruCache;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;


/// Called with each evicted digest while the tracker lock is held.
pub type EvictionCallback = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LruEntry {
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
}

struct TrackerState {
    entries: LruCache<String, LruEntry>,
    current_size: u64,
}

/// Tracks blob sizes in recency order and evicts the least recently used
/// once the total exceeds `max_size`.
///
/// A `max_size` of zero disables tracking.
pub struct LruTracker {
    state: RwLock<TrackerState>,
    max_size: u64,
    on_evict: EvictionCallback,
}

impl LruTracker {
    pub fn new<F>(max_size: u64, on_evict: F) -> Self
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            state: RwLock::new(TrackerState {
                entries: LruCache::unbounded(),
                current_size: 0,
            }),
            max_size,
            on_evict: Box::new(on_evict),
        }
    }

    /// A tracker that ignores every `add`.
    pub fn disabled() -> Self {
        Self::new(0, |_| Ok(()))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Records `digest` as most recently used with `size` bytes, then evicts
    /// from the cold end until the total fits.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::eviction::LruTracker;
    ///
    /// let tracker = LruTracker::new(100, |_| Ok(()));
    /// tracker.add("sha256:a", 60);
    /// tracker.add("sha256:b", 60);
    /// assert!(!tracker.contains("sha256:a"));
    /// assert_eq!(tracker.current_size(), 60);
    /// ```
    pub fn add(&self, digest: &str, size: u64) {
        if !self.is_enabled() {
            return;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let entry = LruEntry {
            size,
            last_accessed: Utc::now(),
        };
        if let Some(previous) = state.entries.put(digest.to_string(), entry) {
            state.current_size -= previous.size;
        }
        state.current_size += size;

        while state.current_size > self.max_size {
            let Some((evicted, entry)) = state.entries.pop_lru() else {
                break;
            };
            state.current_size -= entry.size;
            tracing::info!(
                digest = %evicted,
                size = %format_size(entry.size, BINARY),
                "evicting least recently used blob"
            );
            if let Err(e) = (self.on_evict)(&evicted) {
                tracing::warn!(digest = %evicted, error = %e, "eviction callback failed");
            }
        }
    }

    /// Marks `digest` as most recently used. No-op when not tracked.
    pub fn access(&self, digest: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.entries.get_mut(digest) {
            entry.last_accessed = Utc::now();
        }
    }

    pub fn remove(&self, digest: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.entries.pop(digest) {
            state.current_size -= entry.size;
        }
    }

    pub fn current_size(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current_size
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains(digest)
    }

    pub fn entry(&self, digest: &str) -> Option<LruEntry> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .peek(digest)
            .cloned()
    }

    /// `(digest, size)` pairs, most recently used first.
    pub fn entries(&self) -> Vec<(String, u64)> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(digest, entry)| (digest.clone(), entry.size))
            .collect()
    }
}

/// An eviction callback that queues digests on a channel, plus the
/// receiving end for [`run_eviction_worker`].
pub fn channel_callback() -> (
    impl Fn(&str) -> Result<()> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |digest: &str| {
        tx.send(digest.to_string())
            .map_err(|_| DepotError::server("eviction worker is not running", 500))
    };
    (callback, rx)
}

/// Deletes queued digests from `store` until the channel closes or
/// `shutdown` fires. Manifest records with the digest go first, then the
/// blob. Failures are logged and the digest is dropped.
pub async fn run_eviction_worker(
    mut queue: mpsc::UnboundedReceiver<String>,
    store: Arc<dyn LocalStore>,
    shutdown: CancellationToken,
) {
    loop {
        let digest = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(digest) => digest,
                None => break,
            },
        };

        if let Err(e) = store.delete_manifest(&digest).await {
            tracing::warn!(digest = %digest, error = %e, "failed to delete evicted manifest");
        }
        match store.delete_blob(&digest).await {
            Ok(()) => tracing::debug!(digest = %digest, "deleted evicted blob"),
            Err(e) => tracing::warn!(digest = %digest, error = %e, "failed to delete evicted blob"),
        }
    }
    tracing::debug!("eviction worker stopped");
}

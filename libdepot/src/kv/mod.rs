//! Ephemeral key/value cache for manifest-list payloads, digest redirects
//! and referrers responses.
//!
//! Everything stored here is a soft cache: losing it only causes re-fetches
//! from upstream. A missing key is `Ok(None)`, never an error.

use crate::error::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

#[cfg(test)]
mod tests;

/// Key for a cached manifest-list payload.
pub fn manifest_list_key(repository: &str, reference: &str) -> String {
    format!("manifestlist:{}:{}", repository, reference)
}

/// Key for the content type stored next to a manifest-list payload.
pub fn manifest_list_content_type_key(repository: &str, reference: &str) -> String {
    format!("{}:contenttype", manifest_list_key(repository, reference))
}

/// Key mapping an upstream list digest to the digest of its pruned local copy.
pub fn trimmed_manifest_list_key(digest: &str) -> String {
    format!("trimmedmanifestlist:{}", digest)
}

/// Key for a proxied referrers response. `request_uri` is the path plus
/// query string, so differently filtered listings are cached apart.
///
/// # Examples
///
/// ```
/// use libdepot::kv::referrer_key;
///
/// assert_eq!(
///     referrer_key("/v2/repo/image/referrers?filter=sbom&format=json"),
///     "{referrer_cache}:/v2/repo/image/referrers?filter=sbom&format=json"
/// );
/// ```
pub fn referrer_key(request_uri: &str) -> String {
    format!("{{referrer_cache}}:{}", request_uri)
}

/// A shared byte-string cache with mandatory TTLs.
#[async_trait]
pub trait KvCache: Send + Sync + 'static {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn save(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetches a value stored as UTF-8. Undecodable values count as absent.
    async fn fetch_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .fetch(key)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }
}

/// A cached value together with its expiry metadata.
#[derive(Debug, Clone)]
struct CacheEntry {
    data: Vec<u8>,
    cached_at: SystemTime,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.cached_at).unwrap_or_default() > self.ttl
    }
}

/// Statistics returned after a prune operation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub removed_entries: u64,
    pub reclaimed_bytes: u64,
}

/// Statistics about the cache.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KvStats {
    pub entries: u64,
    pub bytes: u64,
}

impl std::fmt::Display for KvStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} entries, {}",
            self.entries,
            humansize::format_size(self.bytes, humansize::BINARY)
        )
    }
}

/// In-process [`KvCache`] bounded by entry count.
///
/// Least recently used entries are dropped when full; expired entries are
/// dropped when read or pruned.
pub struct MemoryKvCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryKvCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Removes every expired entry.
    pub fn prune(&self) -> PruneStats {
        let now = SystemTime::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut stats = PruneStats::default();
        for key in expired {
            if let Some(entry) = entries.pop(&key) {
                stats.removed_entries += 1;
                stats.reclaimed_bytes += entry.data.len() as u64;
            }
        }
        stats
    }

    pub fn stats(&self) -> KvStats {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        KvStats {
            entries: entries.len() as u64,
            bytes: entries.iter().map(|(_, e)| e.data.len() as u64).sum(),
        }
    }
}

#[async_trait]
impl KvCache for MemoryKvCache {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(SystemTime::now()) => {
                return Ok(Some(entry.data.clone()));
            }
            Some(_) => {}
        }
        entries.pop(key);
        Ok(None)
    }

    async fn save(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            data: value.to_vec(),
            cached_at: SystemTime::now(),
            ttl,
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.pop(key);
        Ok(())
    }
}

//! Upstream registry access.
//!
//! [`RemoteClient`] is the seam between the proxy controller and an upstream
//! registry. [`HttpRemoteFactory`] hands out one HTTP client per upstream,
//! optionally wrapped in a [`LimitedRemote`] that caps concurrent upstream
//! connections through a shared [`ConnectionCounter`]. A [`ThrottledRemote`]
//! caps the bandwidth of blob downloads for one proxy project.

use crate::artifact::ManifestDescriptor;
use crate::client::{ClientConfig, UpstreamClient};
use crate::config;
use crate::error::{DepotError, Result};
use crate::oci::Manifest;
use crate::project::RegistrySettings;
use crate::referrers::ReferrersResponse;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;


/// A boxed stream of blob bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An open blob download: the advertised size and the body.
pub struct BlobReader {
    pub size: u64,
    pub stream: ByteStream,
}

impl BlobReader {
    pub fn new(size: u64, stream: ByteStream) -> Self {
        Self { size, stream }
    }

    /// A reader over an in-memory body.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self {
            size,
            stream: Box::pin(futures::stream::once(async move { Ok(data) })),
        }
    }

    /// Reads the whole body, failing if it is not exactly `size` bytes.
    pub async fn into_bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.size as usize);
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        if buf.len() as u64 != self.size {
            return Err(DepotError::size_mismatch(self.size, buf.len() as u64));
        }
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Read access to an upstream registry. Repository names are upstream
/// names, without the local project prefix.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    /// `HEAD` a manifest. `Ok(None)` means upstream does not have it.
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<ManifestDescriptor>>;

    /// Fetch a manifest and its digest.
    async fn manifest(&self, repository: &str, reference: &str) -> Result<(Manifest, String)>;

    /// Open a blob for streaming.
    async fn blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader>;

    /// All tag names of a repository.
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// The referrers listing of `digest`. `query` is passed through
    /// verbatim, e.g. `artifactType=...`.
    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
        query: Option<&str>,
    ) -> Result<ReferrersResponse>;
}

/// Builds the [`RemoteClient`] for a proxy project's registry.
pub trait RemoteFactory: Send + Sync + 'static {
    fn remote_for(&self, registry: &RegistrySettings) -> Result<Arc<dyn RemoteClient>>;
}

/// Counts open upstream connections per key.
///
/// Implementations may be shared between proxy instances. The check and the
/// increment in `try_acquire` must be atomic for a single key; there is no
/// coordination beyond that, so concurrent instances may briefly overshoot.
#[async_trait]
pub trait ConnectionCounter: Send + Sync + 'static {
    /// Increments the count for `key` if it is below `limit`.
    async fn try_acquire(&self, key: &str, limit: u32) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}

/// Process-local [`ConnectionCounter`].
#[derive(Debug, Default)]
pub struct MemoryCounter {
    counts: Mutex<HashMap<String, u32>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, key: &str) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ConnectionCounter for MemoryCounter {
    async fn try_acquire(&self, key: &str, limit: u32) -> Result<bool> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key.to_string()).or_insert(0);
        if *count >= limit {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(key);
            }
        }
        Ok(())
    }
}

/// Limits applied by [`LimitedRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLimit {
    pub max_connections: u32,
    pub wait_attempts: u32,
    pub wait_interval: Duration,
}

impl ConnectionLimit {
    /// The limit configured in `proxy`, if any.
    pub fn from_config(proxy: &config::Proxy) -> Option<Self> {
        proxy.upstream_max_connections.map(|max| Self {
            max_connections: max,
            wait_attempts: proxy.connection_wait_attempts,
            wait_interval: proxy.connection_wait_interval(),
        })
    }
}

/// A held upstream connection slot. Dropping it releases the slot in the
/// background.
struct ConnectionPermit {
    counter: Option<Arc<dyn ConnectionCounter>>,
    key: String,
}

impl ConnectionPermit {
    async fn release(mut self) {
        if let Some(counter) = self.counter.take()
            && let Err(e) = counter.release(&self.key).await
        {
            tracing::warn!(key = %self.key, error = %e, "failed to release upstream connection slot");
        }
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let Some(counter) = self.counter.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = counter.release(&key).await {
                    tracing::warn!(key = %key, error = %e, "failed to release upstream connection slot");
                }
            });
        }
    }
}

/// Wraps a [`RemoteClient`] so every upstream call holds a connection slot.
///
/// Blob streams keep their slot until the stream is dropped.
pub struct LimitedRemote {
    inner: Arc<dyn RemoteClient>,
    counter: Arc<dyn ConnectionCounter>,
    key: String,
    limit: ConnectionLimit,
}

impl LimitedRemote {
    pub fn new(
        inner: Arc<dyn RemoteClient>,
        counter: Arc<dyn ConnectionCounter>,
        key: impl Into<String>,
        limit: ConnectionLimit,
    ) -> Self {
        Self {
            inner,
            counter,
            key: key.into(),
            limit,
        }
    }

    async fn acquire(&self) -> Result<ConnectionPermit> {
        for attempt in 0..=self.limit.wait_attempts {
            if self
                .counter
                .try_acquire(&self.key, self.limit.max_connections)
                .await?
            {
                return Ok(ConnectionPermit {
                    counter: Some(self.counter.clone()),
                    key: self.key.clone(),
                });
            }
            if attempt < self.limit.wait_attempts {
                tracing::debug!(key = %self.key, attempt, "upstream connection limit reached, waiting");
                tokio::time::sleep(self.limit.wait_interval).await;
            }
        }
        Err(DepotError::rate_limit(
            format!(
                "Upstream connection limit of {} reached for {}",
                self.limit.max_connections, self.key
            ),
            None,
        ))
    }
}

#[async_trait]
impl RemoteClient for LimitedRemote {
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<ManifestDescriptor>> {
        let permit = self.acquire().await?;
        let result = self.inner.manifest_exist(repository, reference).await;
        permit.release().await;
        result
    }

    async fn manifest(&self, repository: &str, reference: &str) -> Result<(Manifest, String)> {
        let permit = self.acquire().await?;
        let result = self.inner.manifest(repository, reference).await;
        permit.release().await;
        result
    }

    async fn blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader> {
        let permit = self.acquire().await?;
        let reader = match self.inner.blob_reader(repository, digest).await {
            Ok(reader) => reader,
            Err(e) => {
                permit.release().await;
                return Err(e);
            }
        };
        let stream = reader.stream.map(move |chunk| {
            let _held = &permit;
            chunk
        });
        Ok(BlobReader::new(reader.size, Box::pin(stream)))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let permit = self.acquire().await?;
        let result = self.inner.list_tags(repository).await;
        permit.release().await;
        result
    }

    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
        query: Option<&str>,
    ) -> Result<ReferrersResponse> {
        let permit = self.acquire().await?;
        let result = self.inner.referrers(repository, digest, query).await;
        permit.release().await;
        result
    }
}

/// Delays `stream` so that it yields at most `bytes_per_second` on average,
/// measured from the moment it is created.
pub fn throttle(stream: ByteStream, bytes_per_second: u64) -> ByteStream {
    let started = tokio::time::Instant::now();
    let rate = bytes_per_second.max(1) as f64;
    Box::pin(futures::stream::unfold(
        (stream, 0u64),
        move |(mut stream, sent)| async move {
            let chunk = stream.next().await?;
            let sent = match &chunk {
                Ok(bytes) => sent + bytes.len() as u64,
                Err(_) => sent,
            };
            tokio::time::sleep_until(started + Duration::from_secs_f64(sent as f64 / rate)).await;
            Some((chunk, (stream, sent)))
        },
    ))
}

/// Wraps a [`RemoteClient`] so blob downloads are held to a bandwidth cap.
/// Manifest, tag and referrers calls pass through untouched.
pub struct ThrottledRemote {
    inner: Arc<dyn RemoteClient>,
    bytes_per_second: u64,
}

impl ThrottledRemote {
    pub fn new(inner: Arc<dyn RemoteClient>, kb_per_second: u32) -> Self {
        Self {
            inner,
            bytes_per_second: u64::from(kb_per_second) * 1024,
        }
    }
}

#[async_trait]
impl RemoteClient for ThrottledRemote {
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<ManifestDescriptor>> {
        self.inner.manifest_exist(repository, reference).await
    }

    async fn manifest(&self, repository: &str, reference: &str) -> Result<(Manifest, String)> {
        self.inner.manifest(repository, reference).await
    }

    async fn blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader> {
        let reader = self.inner.blob_reader(repository, digest).await?;
        tracing::debug!(digest, bytes_per_second = self.bytes_per_second, "throttling blob download");
        Ok(BlobReader::new(
            reader.size,
            throttle(reader.stream, self.bytes_per_second),
        ))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.inner.list_tags(repository).await
    }

    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
        query: Option<&str>,
    ) -> Result<ReferrersResponse> {
        self.inner.referrers(repository, digest, query).await
    }
}

/// [`RemoteFactory`] producing [`UpstreamClient`]s, memoized per registry.
pub struct HttpRemoteFactory {
    client_config: ClientConfig,
    limit: Option<(Arc<dyn ConnectionCounter>, ConnectionLimit)>,
    clients: Mutex<HashMap<i64, (RegistrySettings, Arc<dyn RemoteClient>)>>,
}

impl HttpRemoteFactory {
    pub fn new(network: &config::Network) -> Self {
        Self {
            client_config: ClientConfig::from(network),
            limit: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a factory from the full configuration, with a process-local
    /// connection counter when a limit is configured.
    pub fn from_config(config: &config::Config) -> Self {
        let factory = Self::new(&config.network);
        match ConnectionLimit::from_config(&config.proxy) {
            Some(limit) => factory.with_limit(Arc::new(MemoryCounter::new()), limit),
            None => factory,
        }
    }

    pub fn with_limit(mut self, counter: Arc<dyn ConnectionCounter>, limit: ConnectionLimit) -> Self {
        self.limit = Some((counter, limit));
        self
    }

    fn counter_key(registry: &RegistrySettings) -> String {
        format!("upstream_connections:{}", registry.id)
    }
}

impl RemoteFactory for HttpRemoteFactory {
    fn remote_for(&self, registry: &RegistrySettings) -> Result<Arc<dyn RemoteClient>> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((settings, client)) = clients.get(&registry.id)
            && settings == registry
        {
            return Ok(client.clone());
        }

        let config = self.client_config.clone().with_insecure(registry.insecure);
        let upstream: Arc<dyn RemoteClient> = Arc::new(UpstreamClient::with_config(
            &registry.url,
            registry.credentials.clone(),
            config,
        )?);
        let client = match &self.limit {
            Some((counter, limit)) => Arc::new(LimitedRemote::new(
                upstream,
                counter.clone(),
                Self::counter_key(registry),
                limit.clone(),
            )) as Arc<dyn RemoteClient>,
            None => upstream,
        };

        tracing::debug!(registry_id = registry.id, url = %registry.url, "created upstream client");
        clients.insert(registry.id, (registry.clone(), client.clone()));
        Ok(client)
    }
}

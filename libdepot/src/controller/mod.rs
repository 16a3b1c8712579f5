//! The proxy cache decision engine.
//!
//! [`ProxyController`] decides, per request, whether a manifest or blob is
//! served from the local registry or fetched from upstream, coalesces
//! identical upstream calls, and writes fetched content back to the local
//! registry in the background.
//!
//! # Examples
//!
//! ```no_run
//! use libdepot::controller::{ManifestDecision, ProxyController, RequestContext};
//! use libdepot::remote::{HttpRemoteFactory, RemoteFactory};
//! use libdepot::{ArtifactRef, Config, LocalStore, RegistrySettings};
//! use std::sync::Arc;
//!
//! # async fn example(local: Arc<dyn LocalStore>) -> libdepot::error::Result<()> {
//! let config = Config::default();
//! let controller = ProxyController::builder()
//!     .with_config(config.clone())
//!     .with_local_store(local)
//!     .build()
//!     .await?;
//!
//! let remote = HttpRemoteFactory::from_config(&config)
//!     .remote_for(&RegistrySettings::new(1, "https://registry-1.docker.io"))?;
//! let ctx = RequestContext::default();
//! let art = ArtifactRef::parse("hub/library/alpine", "latest");
//!
//! if let ManifestDecision::UseRemote = controller.use_local_manifest(&ctx, &art, &remote).await? {
//!     let manifest = controller.proxy_manifest(&ctx, &art, &remote).await?;
//!     println!("{} bytes", manifest.payload().len());
//! }
//! # Ok(())
//! # }
//! ```

mod builder;
mod context;

pub use builder::{ControllerCell, ProxyControllerBuilder};
pub use context::RequestContext;

use crate::artifact::{ArtifactRef, LocalArtifact, ManifestDescriptor};
use crate::config;
use crate::error::{DepotError, Result};
use crate::eviction::LruTracker;
use crate::kv::{self, KvCache};
use crate::local::LocalStore;
use crate::manifest_cache::HandlerRegistry;
use crate::oci::{CachedManifestList, Manifest};
use crate::referrers::ReferrersResponse;
use crate::remote::{BlobReader, RemoteClient};
use crate::singleflight::Group;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


/// Binds tags to local artifacts. Implemented by the embedding registry.
#[async_trait]
pub trait TagController: Send + Sync + 'static {
    /// Points `tag` at `artifact`, creating or moving it.
    async fn ensure_tag(&self, artifact: &LocalArtifact, tag: &str) -> Result<()>;

    async fn update_pull_time(&self, artifact: &LocalArtifact, tag: &str) -> Result<()>;
}

/// An artifact was pulled through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullEvent {
    pub repository: String,
    pub digest: String,
    /// Empty for pulls by digest.
    pub tag: String,
    pub operator: String,
    pub occurred_at: DateTime<Utc>,
}

/// Receives pull notifications.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn pull_artifact(&self, event: PullEvent);
}

/// Outcome of [`ProxyController::use_local_manifest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDecision {
    /// Serve from the local registry.
    UseLocal,
    /// Serve this manifest list payload from the KV cache.
    UseCachedList(CachedManifestList),
    /// Fetch from upstream.
    UseRemote,
}

struct ControllerInner {
    local: Arc<dyn LocalStore>,
    kv: Arc<dyn KvCache>,
    proxy: config::Proxy,
    handlers: HandlerRegistry,
    lru: Arc<LruTracker>,
    tags: Arc<dyn TagController>,
    events: Arc<dyn EventSink>,
    manifest_exist: Group<Option<ManifestDescriptor>>,
    manifest_fetch: Group<Manifest>,
    blobs: Group<bool>,
    shutdown: CancellationToken,
}

/// Orchestrates local and upstream access for proxy projects.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ProxyController {
    inner: Arc<ControllerInner>,
}

impl ProxyController {
    pub fn builder() -> ProxyControllerBuilder {
        ProxyControllerBuilder::new()
    }

    pub fn config(&self) -> &config::Proxy {
        &self.inner.proxy
    }

    pub fn lru(&self) -> &LruTracker {
        &self.inner.lru
    }

    /// Cancels every background task and the eviction worker.
    pub fn shutdown(&self) {
        tracing::info!("shutting down proxy controller");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Returns true if the blob `art.digest` can be served locally.
    /// Local store errors count as a miss.
    pub async fn use_local_blob(&self, _ctx: &RequestContext, art: &ArtifactRef) -> bool {
        if art.digest.is_empty() {
            return false;
        }
        match self.inner.local.blob_exist(art).await {
            Ok(true) => {
                self.inner.lru.access(&art.digest);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::debug!(artifact = %art, error = %e, "local blob lookup failed");
                false
            }
        }
    }

    /// Decides where a manifest request is served from.
    ///
    /// `NotFound` and `RateLimit` errors are returned verbatim, except that
    /// a rate-limited upstream falls back to an existing local copy.
    pub async fn use_local_manifest(
        &self,
        ctx: &RequestContext,
        art: &ArtifactRef,
        remote: &Arc<dyn RemoteClient>,
    ) -> Result<ManifestDecision> {
        let local = self.inner.local.get_manifest(art).await?;
        if local.is_some() && !art.digest.is_empty() {
            self.inner.lru.access(&art.digest);
            return Ok(ManifestDecision::UseLocal);
        }

        let descriptor = match self.head_manifest(ctx, art, remote).await {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_rate_limit() && local.is_some() => {
                tracing::warn!(artifact = %art, error = %e, "upstream rate limited, serving local copy");
                return Ok(ManifestDecision::UseLocal);
            }
            Err(e) => return Err(e),
        };
        let Some(descriptor) = descriptor else {
            return Err(DepotError::not_found("manifest".to_string(), art.to_string()));
        };

        let art = if art.digest.is_empty() {
            art.with_digest(&descriptor.digest)
        } else {
            art.clone()
        };
        let matches_local = local.is_some_and(|a| a.digest == descriptor.digest);
        if matches_local {
            self.inner.lru.access(&descriptor.digest);
        }

        let content = match self
            .inner
            .kv
            .fetch(&kv::manifest_list_key(&art.repository, art.reference()))
            .await
        {
            Ok(Some(content)) => content,
            Ok(None) => return Ok(Self::local_or_remote(matches_local)),
            Err(e) => {
                tracing::debug!(artifact = %art, error = %e, "manifest list cache lookup failed");
                return Ok(Self::local_or_remote(matches_local));
            }
        };
        match self
            .inner
            .kv
            .fetch_string(&kv::manifest_list_content_type_key(
                &art.repository,
                art.reference(),
            ))
            .await
        {
            Ok(Some(content_type)) => Ok(ManifestDecision::UseCachedList(CachedManifestList {
                content: content.into(),
                digest: descriptor.digest,
                content_type,
            })),
            _ => Ok(ManifestDecision::UseRemote),
        }
    }

    fn local_or_remote(use_local: bool) -> ManifestDecision {
        if use_local {
            ManifestDecision::UseLocal
        } else {
            ManifestDecision::UseRemote
        }
    }

    /// `HEAD`s the manifest upstream, coalesced per repository and
    /// reference. `Ok(None)` means upstream does not have it.
    pub async fn head_manifest(
        &self,
        ctx: &RequestContext,
        art: &ArtifactRef,
        remote: &Arc<dyn RemoteClient>,
    ) -> Result<Option<ManifestDescriptor>> {
        let remote = remote.clone();
        let repository = art.remote_repository().to_string();
        let reference = art.reference().to_string();
        ctx.run(self.inner.manifest_exist.run(&art.remote_key(), move || async move {
            remote.manifest_exist(&repository, &reference).await
        }))
        .await
    }

    /// Fetches the manifest upstream, coalesced per repository and
    /// reference, and caches it locally in the background.
    pub async fn proxy_manifest(
        &self,
        ctx: &RequestContext,
        art: &ArtifactRef,
        remote: &Arc<dyn RemoteClient>,
    ) -> Result<Manifest> {
        let this = self.clone();
        let background = ctx.detach(&self.inner.shutdown);
        let art_owned = art.clone();
        let remote = remote.clone();
        ctx.run(self.inner.manifest_fetch.run(&art.remote_key(), move || async move {
            let (manifest, digest) = remote
                .manifest(art_owned.remote_repository(), art_owned.reference())
                .await?;
            let cached = manifest.clone();
            let operator = background.operator().name().to_string();
            let worker = this.clone();
            this.spawn_background(&background, "cache manifest", async move {
                worker
                    .cache_manifest(&operator, art_owned, cached, digest, remote)
                    .await
            });
            Ok(manifest)
        }))
        .await
    }

    async fn cache_manifest(
        &self,
        operator: &str,
        art: ArtifactRef,
        manifest: Manifest,
        digest: String,
        remote: Arc<dyn RemoteClient>,
    ) {
        let local = match self.inner.local.get_manifest(&art).await {
            Ok(local) => local,
            Err(e) => {
                tracing::error!(artifact = %art, error = %e, "local manifest lookup failed");
                return;
            }
        };

        let target = if art.digest.is_empty() {
            art.with_digest(&digest)
        } else {
            art.clone()
        };

        let stale = art.tag.is_empty() || local.is_none_or(|a| a.digest != digest);
        if stale {
            let handler = self.inner.handlers.handler_for(manifest.media_type());
            if let Err(e) = handler
                .cache_content(&target, &manifest, remote.as_ref(), manifest.media_type())
                .await
            {
                tracing::error!(artifact = %target, error = %e, "failed to cache manifest");
                return;
            }
            self.inner
                .lru
                .add(&target.digest, manifest.payload().len() as u64);
            tracing::info!(artifact = %target, "cached manifest");

            if !art.tag.is_empty()
                && let Err(e) = self.ensure_tag(&target, &art.tag).await
            {
                tracing::warn!(artifact = %target, tag = %art.tag, error = %e, "failed to tag cached manifest");
            }
        }

        let published = self.resolve_trimmed(&target).await;
        match self.inner.local.get_manifest(&published).await {
            Ok(Some(artifact)) => {
                self.inner
                    .events
                    .pull_artifact(PullEvent {
                        repository: artifact.repository,
                        digest: artifact.digest,
                        tag: art.tag.clone(),
                        operator: operator.to_string(),
                        occurred_at: Utc::now(),
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(artifact = %published, error = %e, "local manifest lookup failed"),
        }
    }

    /// Opens a blob from upstream and caches it.
    ///
    /// With asynchronous caching the upstream stream is returned directly and
    /// a separate download fills the local copy. Otherwise the blob is cached
    /// first (coalesced per repository and digest) and served from the
    /// local registry. When another request is already writing the same blob
    /// locally, this waits for that write to land and streams from upstream
    /// if it does not within `push_wait_attempts`.
    pub async fn proxy_blob(
        &self,
        ctx: &RequestContext,
        art: &ArtifactRef,
        remote: &Arc<dyn RemoteClient>,
    ) -> Result<BlobReader> {
        if art.digest.is_empty() {
            return Err(DepotError::validation("Blob requests need a digest"));
        }

        if self.inner.proxy.async_local_caching {
            let reader = ctx
                .run(remote.blob_reader(art.remote_repository(), &art.digest))
                .await?;
            let this = self.clone();
            let art = art.clone();
            let remote = remote.clone();
            self.spawn_background(&ctx.detach(&self.inner.shutdown), "cache blob", async move {
                match this.fill_blob(&art, remote.as_ref()).await {
                    Ok(()) => {}
                    Err(e) if e.is_conflict() => {
                        tracing::debug!(artifact = %art, "blob already being cached")
                    }
                    Err(e) => tracing::error!(artifact = %art, error = %e, "failed to cache blob"),
                }
            });
            return Ok(reader);
        }

        let this = self.clone();
        let art_owned = art.clone();
        let key = format!("{}:{}", art.remote_repository(), art.digest);
        let filler = remote.clone();
        let cached = ctx
            .run(self.inner.blobs.run(&key, move || async move {
                if this.inner.local.blob_exist(&art_owned).await? {
                    return Ok(true);
                }
                match this.fill_blob(&art_owned, filler.as_ref()).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_conflict() => this.wait_for_blob(&art_owned).await,
                    Err(e) => Err(e),
                }
            }))
            .await?;

        if !cached {
            tracing::warn!(artifact = %art, "concurrent blob push did not finish, streaming from upstream");
            return ctx
                .run(remote.blob_reader(art.remote_repository(), &art.digest))
                .await;
        }
        ctx.run(self.inner.local.pull_blob(&art.repository, &art.digest))
            .await
    }

    /// Downloads the blob and writes it locally. Fails with `Conflict`,
    /// without touching the LRU, when another push of the blob is running.
    async fn fill_blob(&self, art: &ArtifactRef, remote: &dyn RemoteClient) -> Result<()> {
        let reader = remote
            .blob_reader(art.remote_repository(), &art.digest)
            .await?;
        let size = reader.size;
        self.inner
            .local
            .push_blob(&art.repository, &art.digest, reader)
            .await?;
        self.inner.lru.add(&art.digest, size);
        tracing::info!(artifact = %art, size, "cached blob");
        Ok(())
    }

    /// Polls the local registry for a blob someone else is writing.
    async fn wait_for_blob(&self, art: &ArtifactRef) -> Result<bool> {
        let interval = self.inner.proxy.push_wait_interval();
        for attempt in 1..=self.inner.proxy.push_wait_attempts {
            tokio::time::sleep(interval).await;
            if self.inner.local.blob_exist(art).await? {
                tracing::debug!(artifact = %art, attempt, "blob landed from concurrent push");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Answers a referrers request for `art.digest` from the KV cache, or
    /// from upstream, caching the answer for `referrer_cache_ttl`.
    ///
    /// `request_uri` is the path and query of the incoming request; it keys
    /// the cache and its query string is forwarded upstream.
    pub async fn proxy_referrers(
        &self,
        ctx: &RequestContext,
        art: &ArtifactRef,
        request_uri: &str,
        remote: &Arc<dyn RemoteClient>,
    ) -> Result<ReferrersResponse> {
        if art.digest.is_empty() {
            return Err(DepotError::validation("Referrers requests need a digest"));
        }
        let key = kv::referrer_key(request_uri);
        match self.inner.kv.fetch(&key).await {
            Ok(Some(data)) => match ReferrersResponse::from_cache_bytes(&data) {
                Ok(cached) => {
                    tracing::debug!(artifact = %art, "serving cached referrers");
                    return Ok(cached);
                }
                Err(e) => tracing::debug!(artifact = %art, error = %e, "ignoring cached referrers"),
            },
            Ok(None) => {}
            Err(e) => tracing::debug!(artifact = %art, error = %e, "referrers cache lookup failed"),
        }

        let query = request_uri.split_once('?').map(|(_, query)| query);
        let response = ctx
            .run(remote.referrers(art.remote_repository(), &art.digest, query))
            .await?;

        let saved = match response.to_cache_bytes() {
            Ok(data) => {
                self.inner
                    .kv
                    .save(&key, &data, self.inner.proxy.referrer_cache_ttl())
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            tracing::warn!(artifact = %art, error = %e, "failed to cache referrers");
        }
        Ok(response)
    }

    /// Points `tag` at the local artifact for `art.digest`, following a
    /// trimmed-list redirect if one was recorded.
    pub async fn ensure_tag(&self, art: &ArtifactRef, tag: &str) -> Result<()> {
        let art = self.resolve_trimmed(art).await;
        let artifact = self
            .inner
            .local
            .get_manifest(&art)
            .await?
            .ok_or_else(|| DepotError::not_found("manifest".to_string(), art.to_string()))?;
        self.inner.tags.ensure_tag(&artifact, tag).await?;
        self.inner.tags.update_pull_time(&artifact, tag).await?;
        tracing::debug!(artifact = %art, tag, "tag ensured");
        Ok(())
    }

    /// Retries [`ProxyController::ensure_tag`] in the background until it
    /// succeeds or `ensure_tag_max_retry` attempts have passed.
    pub fn spawn_ensure_tag(&self, ctx: &RequestContext, art: ArtifactRef, tag: String) {
        let this = self.clone();
        let attempts = self.inner.proxy.ensure_tag_max_retry;
        let interval = self.inner.proxy.ensure_tag_interval();
        self.spawn_background(&ctx.detach(&self.inner.shutdown), "ensure tag", async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(interval).await;
                match this.ensure_tag(&art, &tag).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(artifact = %art, tag = %tag, attempt, error = %e, "tag not ready")
                    }
                }
            }
            tracing::debug!(artifact = %art, tag = %tag, "giving up on tag");
        });
    }

    async fn resolve_trimmed(&self, art: &ArtifactRef) -> ArtifactRef {
        if art.digest.is_empty() {
            return art.clone();
        }
        match self
            .inner
            .kv
            .fetch_string(&kv::trimmed_manifest_list_key(&art.digest))
            .await
        {
            Ok(Some(trimmed)) if trimmed != art.digest => {
                tracing::debug!(artifact = %art, trimmed = %trimmed, "following trimmed manifest list");
                art.with_digest(trimmed)
            }
            _ => art.clone(),
        }
    }

    /// Runs `work` detached from the request, bounded by the background
    /// timeout and stopped by [`ProxyController::shutdown`].
    fn spawn_background<F>(&self, ctx: &RequestContext, task: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timeout = self.inner.proxy.background_timeout();
        let cancel = ctx.cancellation().clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => tracing::debug!(task, "background task cancelled"),
                    finished = tokio::time::timeout(timeout, work) => {
                        if finished.is_err() {
                            tracing::warn!(task, ?timeout, "background task timed out");
                        }
                    }
                }
            }
            .instrument(ctx.span().clone()),
        );
    }
}

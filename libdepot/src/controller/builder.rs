use super::{ControllerInner, EventSink, PullEvent, ProxyController, TagController};
use crate::artifact::LocalArtifact;
use crate::config::Config;
use crate::error::{DepotError, Result};
use crate::eviction::{self, LruTracker};
use crate::inflight::InflightSet;
use crate::kv::{KvCache, MemoryKvCache};
use crate::local::{GuardedLocalStore, LocalStore};
use crate::manifest_cache::HandlerRegistry;
use crate::singleflight::Group;
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Builder for a [`ProxyController`].
///
/// Only the local store is required. Without a KV cache an in-memory one
/// sized by `kv.memory_entries` is used; without a tag controller or event
/// sink, tagging and pull events are skipped.
///
/// # Examples
///
/// ```no_run
/// use libdepot::controller::ProxyController;
/// use libdepot::LocalStore;
/// use std::sync::Arc;
///
/// # async fn example(local: Arc<dyn LocalStore>) -> libdepot::error::Result<()> {
/// let controller = ProxyController::builder()
///     .with_config_file("/etc/depot/config.yaml")
///     .with_local_store(local)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ProxyControllerBuilder {
    config: Option<Config>,
    config_path: Option<PathBuf>,
    local: Option<Arc<dyn LocalStore>>,
    kv: Option<Arc<dyn KvCache>>,
    tags: Option<Arc<dyn TagController>>,
    events: Option<Arc<dyn EventSink>>,
}

impl ProxyControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration directly.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Load configuration from a YAML file when building.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_kv_cache(mut self, kv: Arc<dyn KvCache>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_tag_controller(mut self, tags: Arc<dyn TagController>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the controller and starts the eviction worker when
    /// `proxy.lru_max_size_bytes` is set.
    pub async fn build(self) -> Result<ProxyController> {
        let config = match (self.config, self.config_path) {
            (Some(config), _) => {
                config.validate()?;
                config
            }
            (None, path) => Config::load(path.as_deref())?,
        };
        let raw_local = self
            .local
            .ok_or_else(|| DepotError::config("A local store is required", None))?;

        let shutdown = CancellationToken::new();
        let inflight = Arc::new(InflightSet::new());
        let local: Arc<dyn LocalStore> =
            Arc::new(GuardedLocalStore::new(raw_local.clone(), inflight));
        let kv: Arc<dyn KvCache> = match self.kv {
            Some(kv) => kv,
            None => Arc::new(MemoryKvCache::new(config.kv.memory_entries)),
        };
        let tags: Arc<dyn TagController> = match self.tags {
            Some(tags) => tags,
            None => Arc::new(NoTags),
        };
        let events: Arc<dyn EventSink> = match self.events {
            Some(events) => events,
            None => Arc::new(NoEvents),
        };

        let max_size = config.proxy.lru_max_size_bytes;
        let lru = if max_size > 0 {
            let (callback, queue) = eviction::channel_callback();
            tokio::spawn(eviction::run_eviction_worker(
                queue,
                raw_local,
                shutdown.child_token(),
            ));
            LruTracker::new(max_size, callback)
        } else {
            LruTracker::disabled()
        };

        tracing::debug!(
            async_local_caching = config.proxy.async_local_caching,
            lru_max_size_bytes = max_size,
            "proxy controller ready"
        );

        Ok(ProxyController {
            inner: Arc::new(ControllerInner {
                handlers: HandlerRegistry::new(local.clone(), kv.clone(), config.proxy.clone()),
                local,
                kv,
                proxy: config.proxy,
                lru: Arc::new(lru),
                tags,
                events,
                manifest_exist: Group::new(),
                manifest_fetch: Group::new(),
                blobs: Group::new(),
                shutdown,
            }),
        })
    }
}

struct NoTags;

#[async_trait]
impl TagController for NoTags {
    async fn ensure_tag(&self, artifact: &LocalArtifact, tag: &str) -> Result<()> {
        tracing::debug!(digest = %artifact.digest, tag, "no tag controller configured");
        Ok(())
    }

    async fn update_pull_time(&self, _artifact: &LocalArtifact, _tag: &str) -> Result<()> {
        Ok(())
    }
}

struct NoEvents;

#[async_trait]
impl EventSink for NoEvents {
    async fn pull_artifact(&self, _event: PullEvent) {}
}

/// A process-wide controller built on first use.
///
/// Concurrent first callers wait for a single initialization.
///
/// ```no_run
/// use libdepot::controller::{ControllerCell, ProxyController};
/// use libdepot::LocalStore;
/// use std::sync::Arc;
///
/// static CONTROLLER: ControllerCell = ControllerCell::new();
///
/// # async fn example(local: Arc<dyn LocalStore>) -> libdepot::error::Result<()> {
/// let controller = CONTROLLER
///     .get_or_try_init(|| ProxyController::builder().with_local_store(local).build())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ControllerCell {
    cell: OnceCell<ProxyController>,
}

impl ControllerCell {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub fn get(&self) -> Option<&ProxyController> {
        self.cell.get()
    }

    /// Returns the controller, running `init` if none exists yet. A failed
    /// initialization leaves the cell empty.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<&ProxyController>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProxyController>>,
    {
        self.cell.get_or_try_init(init).await
    }
}

impl Default for ControllerCell {
    fn default() -> Self {
        Self::new()
    }
}

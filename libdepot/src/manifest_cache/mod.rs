//! Write-back of manifests fetched from upstream into the local registry.
//!
//! A manifest is only published locally once everything it references is
//! local too. For an image manifest that means its blobs; missing blobs are
//! copied from upstream after a short wait. For a manifest list it means its
//! child manifests, which other requests are busy caching; the list waits
//! for them and is then published with whatever children made it.

use crate::artifact::ArtifactRef;
use crate::config;
use crate::digest::is_digest;
use crate::error::{DepotError, Result};
use crate::kv::{self, KvCache};
use crate::local::LocalStore;
use crate::oci::{self, Manifest};
use crate::remote::RemoteClient;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;


/// Publishes an upstream manifest into the local registry.
#[async_trait]
pub trait ManifestCacheHandler: Send + Sync + 'static {
    /// Caches `manifest`, fetched for `art`. `art.digest` is always set.
    async fn cache_content(
        &self,
        art: &ArtifactRef,
        manifest: &Manifest,
        remote: &dyn RemoteClient,
        content_type: &str,
    ) -> Result<()>;
}

/// Handler for image indexes and Docker manifest lists.
pub struct ManifestListCache {
    local: Arc<dyn LocalStore>,
    kv: Arc<dyn KvCache>,
    proxy: config::Proxy,
}

impl ManifestListCache {
    pub fn new(local: Arc<dyn LocalStore>, kv: Arc<dyn KvCache>, proxy: config::Proxy) -> Self {
        Self { local, kv, proxy }
    }

    /// The list restricted to children already present locally.
    async fn update_manifest_list(&self, repository: &str, manifest: &Manifest) -> Result<Manifest> {
        let mut present = HashSet::new();
        for child in manifest.reference_digests() {
            let lookup = ArtifactRef::parse(repository, &child);
            if self.local.get_manifest(&lookup).await?.is_some() {
                present.insert(child);
            }
        }
        manifest.with_children(&present)
    }

    /// Waits for the children, then publishes the (possibly pruned) list.
    pub async fn push(&self, art: &ArtifactRef, manifest: &Manifest) -> Result<()> {
        let expected = manifest.reference_digests().len();
        let mut pruned = self.update_manifest_list(&art.repository, manifest).await?;
        let mut attempt = 0;
        while pruned.reference_digests().len() < expected
            && attempt < self.proxy.max_manifest_list_wait
        {
            tokio::time::sleep(self.proxy.sleep_interval()).await;
            attempt += 1;
            pruned = self.update_manifest_list(&art.repository, manifest).await?;
            tracing::debug!(
                artifact = %art,
                attempt,
                present = pruned.reference_digests().len(),
                expected,
                "waiting for manifest list children"
            );
        }

        let kept = pruned.reference_digests().len();
        if kept == 0 {
            return Err(DepotError::validation(
                "manifest list doesn't contain any pushed manifest",
            ));
        }

        let new_digest = pruned.digest();
        if kept < expected {
            tracing::info!(
                artifact = %art,
                kept,
                expected,
                digest = %new_digest,
                "publishing trimmed manifest list"
            );
        }
        if !art.digest.is_empty() {
            self.kv
                .save(
                    &kv::trimmed_manifest_list_key(&art.digest),
                    new_digest.as_bytes(),
                    self.proxy.trimmed_digest_ttl(),
                )
                .await?;
        }

        if !art.tag.is_empty()
            && let Some(existing) = self.local.get_manifest(&art.with_tag(&art.tag)).await?
            && existing.digest == new_digest
        {
            tracing::debug!(artifact = %art, "manifest list already published");
            return Ok(());
        }

        let reference = if is_digest(art.reference()) {
            new_digest.as_str()
        } else {
            art.reference()
        };
        tolerate_concurrent_push(
            self.local
                .push_manifest(&art.repository, reference, &pruned)
                .await,
        )
    }
}

/// A push refused because an identical one is running leaves the content
/// on its way to the local registry, which is all the caller needs.
fn tolerate_concurrent_push(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_conflict() => {
            tracing::debug!(error = %e, "identical push already in progress");
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl ManifestCacheHandler for ManifestListCache {
    async fn cache_content(
        &self,
        art: &ArtifactRef,
        manifest: &Manifest,
        _remote: &dyn RemoteClient,
        content_type: &str,
    ) -> Result<()> {
        let art = if art.digest.is_empty() {
            art.with_digest(manifest.digest())
        } else {
            art.clone()
        };

        let ttl = self.proxy.manifest_list_cache_ttl();
        self.kv
            .save(
                &kv::manifest_list_key(&art.repository, art.reference()),
                manifest.payload(),
                ttl,
            )
            .await?;
        self.kv
            .save(
                &kv::manifest_list_content_type_key(&art.repository, art.reference()),
                content_type.as_bytes(),
                ttl,
            )
            .await?;

        self.push(&art, manifest).await
    }
}

/// Handler for single-image manifests, and the fallback for unknown types.
pub struct ManifestCache {
    local: Arc<dyn LocalStore>,
    proxy: config::Proxy,
}

impl ManifestCache {
    pub fn new(local: Arc<dyn LocalStore>, proxy: config::Proxy) -> Self {
        Self { local, proxy }
    }
}

#[async_trait]
impl ManifestCacheHandler for ManifestCache {
    async fn cache_content(
        &self,
        art: &ArtifactRef,
        manifest: &Manifest,
        remote: &dyn RemoteClient,
        _content_type: &str,
    ) -> Result<()> {
        let repository = &art.repository;
        let mut missing = self.local.check_dependencies(repository, manifest).await?;
        let mut attempt = 0;
        while !missing.is_empty() && attempt < self.proxy.max_manifest_wait {
            tokio::time::sleep(self.proxy.sleep_interval()).await;
            attempt += 1;
            missing = self.local.check_dependencies(repository, manifest).await?;
            tracing::debug!(artifact = %art, attempt, missing = missing.len(), "waiting for blobs");
        }

        // The client skips layers it already has, so those never reach us
        // through a blob pull.
        for descriptor in missing {
            let digest = descriptor.digest().to_string();
            tracing::debug!(artifact = %art, digest = %digest, "copying missing blob from upstream");
            let blob = remote.blob_reader(art.remote_repository(), &digest).await?;
            tolerate_concurrent_push(self.local.push_blob(repository, &digest, blob).await)?;
        }

        tolerate_concurrent_push(
            self.local
                .push_manifest(repository, art.reference(), manifest)
                .await,
        )
    }
}

/// Picks the handler for a manifest's content type.
pub struct HandlerRegistry {
    by_type: HashMap<&'static str, Arc<dyn ManifestCacheHandler>>,
    fallback: Arc<dyn ManifestCacheHandler>,
}

impl HandlerRegistry {
    pub fn new(local: Arc<dyn LocalStore>, kv: Arc<dyn KvCache>, proxy: config::Proxy) -> Self {
        let list: Arc<dyn ManifestCacheHandler> =
            Arc::new(ManifestListCache::new(local.clone(), kv, proxy.clone()));
        let single: Arc<dyn ManifestCacheHandler> = Arc::new(ManifestCache::new(local, proxy));

        let mut by_type = HashMap::new();
        by_type.insert(oci::OCI_IMAGE_INDEX, list.clone());
        by_type.insert(oci::DOCKER_MANIFEST_LIST, list);
        by_type.insert(oci::DOCKER_MANIFEST, single.clone());

        Self {
            by_type,
            fallback: single,
        }
    }

    pub fn handler_for(&self, content_type: &str) -> Arc<dyn ManifestCacheHandler> {
        self.by_type
            .get(content_type)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

//! Access to the local registry that holds mirrored content.
//!
//! [`LocalStore`] is implemented by the embedding registry. The proxy
//! controller never talks to it directly: it goes through a
//! [`GuardedLocalStore`], which refuses a push with
//! [`DepotError::Conflict`] when an identical one is already running.

use crate::artifact::{ArtifactRef, LocalArtifact};
use crate::error::{DepotError, Result};
use crate::inflight::InflightSet;
use crate::oci::{Descriptor, Manifest};
use crate::remote::BlobReader;
use async_trait::async_trait;
use std::sync::Arc;


/// Operations the proxy cache needs from the local registry.
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    /// Returns true if the blob `art.digest` is present in `art.repository`.
    async fn blob_exist(&self, art: &ArtifactRef) -> Result<bool>;

    /// Looks up a manifest by `art.digest`, or by `art.tag` when no digest
    /// is set. `Ok(None)` when absent.
    async fn get_manifest(&self, art: &ArtifactRef) -> Result<Option<LocalArtifact>>;

    async fn push_blob(&self, repository: &str, digest: &str, blob: BlobReader) -> Result<()>;

    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<BlobReader>;

    /// Stores `manifest` under `reference` (a tag or a digest).
    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()>;

    /// Descriptors referenced by `manifest` whose content is not yet local.
    async fn check_dependencies(
        &self,
        repository: &str,
        manifest: &Manifest,
    ) -> Result<Vec<Descriptor>>;

    /// Removes a blob from local storage.
    async fn delete_blob(&self, digest: &str) -> Result<()>;

    /// Removes every manifest record (and the tags pointing at it) whose
    /// digest is `digest`. Absent records are not an error.
    async fn delete_manifest(&self, digest: &str) -> Result<()>;
}

/// Wraps a [`LocalStore`] so that concurrent pushes of the same
/// `repository:reference` collapse into one.
///
/// A push whose key is already held fails with [`DepotError::Conflict`]
/// without touching the inner store. Callers that only need the content to
/// end up local treat that as "someone else is writing it".
pub struct GuardedLocalStore {
    inner: Arc<dyn LocalStore>,
    inflight: Arc<InflightSet>,
}

impl GuardedLocalStore {
    pub fn new(inner: Arc<dyn LocalStore>, inflight: Arc<InflightSet>) -> Self {
        Self { inner, inflight }
    }

    fn push_key(repository: &str, reference: &str) -> String {
        format!("{}:{}", repository, reference)
    }
}

#[async_trait]
impl LocalStore for GuardedLocalStore {
    async fn blob_exist(&self, art: &ArtifactRef) -> Result<bool> {
        self.inner.blob_exist(art).await
    }

    async fn get_manifest(&self, art: &ArtifactRef) -> Result<Option<LocalArtifact>> {
        self.inner.get_manifest(art).await
    }

    async fn push_blob(&self, repository: &str, digest: &str, blob: BlobReader) -> Result<()> {
        let key = Self::push_key(repository, digest);
        let Some(_guard) = InflightSet::guard(&self.inflight, &key) else {
            tracing::debug!(key = %key, "blob push already in progress, skipping");
            return Err(DepotError::conflict(format!("blob push {} already in progress", key)));
        };
        self.inner.push_blob(repository, digest, blob).await
    }

    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<BlobReader> {
        self.inner.pull_blob(repository, digest).await
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        let key = Self::push_key(repository, reference);
        let Some(_guard) = InflightSet::guard(&self.inflight, &key) else {
            tracing::debug!(key = %key, "manifest push already in progress, skipping");
            return Err(DepotError::conflict(format!(
                "manifest push {} already in progress",
                key
            )));
        };
        self.inner
            .push_manifest(repository, reference, manifest)
            .await
    }

    async fn check_dependencies(
        &self,
        repository: &str,
        manifest: &Manifest,
    ) -> Result<Vec<Descriptor>> {
        self.inner.check_dependencies(repository, manifest).await
    }

    async fn delete_blob(&self, digest: &str) -> Result<()> {
        self.inner.delete_blob(digest).await
    }

    async fn delete_manifest(&self, digest: &str) -> Result<()> {
        self.inner.delete_manifest(digest).await
    }
}

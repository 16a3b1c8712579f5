//! In-memory collaborators for unit tests.

use crate::artifact::{ArtifactRef, LocalArtifact, ManifestDescriptor};
use crate::controller::{EventSink, PullEvent, TagController};
use crate::digest::sha256_of;
use crate::error::{DepotError, Result};
use crate::local::LocalStore;
use crate::oci::{DOCKER_MANIFEST, Descriptor, Manifest, OCI_IMAGE_INDEX, OCI_IMAGE_MANIFEST};
use crate::referrers::ReferrersResponse;
use crate::remote::{BlobReader, RemoteClient};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An image manifest referencing a config blob and `layers`.
pub(crate) fn image_manifest(config: &[u8], layers: &[&[u8]]) -> Manifest {
    let layers: Vec<String> = layers
        .iter()
        .map(|l| {
            format!(
                r#"{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","digest":"{}","size":{}}}"#,
                sha256_of(l),
                l.len()
            )
        })
        .collect();
    let json = format!(
        r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"mediaType":"application/vnd.docker.container.image.v1+json","digest":"{}","size":{}}},"layers":[{}]}}"#,
        DOCKER_MANIFEST,
        sha256_of(config),
        config.len(),
        layers.join(",")
    );
    Manifest::from_bytes(DOCKER_MANIFEST, json).unwrap_or_else(|e| panic!("fixture: {e}"))
}

/// An OCI image index over `children`.
pub(crate) fn index_of(children: &[&Manifest]) -> Manifest {
    let archs = ["amd64", "arm64", "s390x", "ppc64le", "riscv64"];
    let entries: Vec<String> = children
        .iter()
        .enumerate()
        .map(|(i, m)| {
            format!(
                r#"{{"mediaType":"{}","digest":"{}","size":{},"platform":{{"architecture":"{}","os":"linux"}}}}"#,
                OCI_IMAGE_MANIFEST,
                m.digest(),
                m.payload().len(),
                archs[i % archs.len()]
            )
        })
        .collect();
    let json = format!(
        r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[{}]}}"#,
        OCI_IMAGE_INDEX,
        entries.join(",")
    );
    Manifest::from_bytes(OCI_IMAGE_INDEX, json).unwrap_or_else(|e| panic!("fixture: {e}"))
}

#[derive(Default)]
struct RemoteState {
    manifests: HashMap<(String, String), (Manifest, String)>,
    blobs: HashMap<String, Bytes>,
    tags: HashMap<String, Vec<String>>,
    /// (repository, digest) -> listing
    referrers: HashMap<(String, String), ReferrersResponse>,
    /// Query string of every referrers call, in order.
    referrer_queries: Vec<Option<String>>,
    error: Option<DepotError>,
}

/// Upstream registry double with per-operation call counters.
#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<RemoteState>,
    delay: Mutex<Duration>,
    pub head_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub blob_calls: AtomicUsize,
    pub tag_calls: AtomicUsize,
    pub referrer_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `manifest` by digest and, if given, by `tag`. Returns the digest.
    pub fn add_manifest(&self, repository: &str, tag: Option<&str>, manifest: &Manifest) -> String {
        let digest = manifest.digest();
        let mut state = lock(&self.state);
        let entry = (manifest.clone(), digest.clone());
        state
            .manifests
            .insert((repository.to_string(), digest.clone()), entry.clone());
        if let Some(tag) = tag {
            state
                .manifests
                .insert((repository.to_string(), tag.to_string()), entry);
        }
        digest
    }

    pub fn add_blob(&self, data: &[u8]) -> String {
        let digest = sha256_of(data);
        lock(&self.state)
            .blobs
            .insert(digest.clone(), Bytes::copy_from_slice(data));
        digest
    }

    pub fn set_tags(&self, repository: &str, tags: &[&str]) {
        lock(&self.state).tags.insert(
            repository.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
    }

    pub fn set_referrers(&self, repository: &str, digest: &str, response: ReferrersResponse) {
        lock(&self.state)
            .referrers
            .insert((repository.to_string(), digest.to_string()), response);
    }

    pub fn referrer_queries(&self) -> Vec<Option<String>> {
        lock(&self.state).referrer_queries.clone()
    }

    /// Every call fails with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<DepotError>) {
        lock(&self.state).error = error;
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_error(&self) -> Result<()> {
        match &lock(&self.state).error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn lookup(&self, repository: &str, reference: &str) -> Option<(Manifest, String)> {
        lock(&self.state)
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<ManifestDescriptor>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_error()?;
        Ok(self
            .lookup(repository, reference)
            .map(|(manifest, digest)| ManifestDescriptor {
                media_type: manifest.media_type().to_string(),
                digest,
                size: manifest.payload().len() as u64,
            }))
    }

    async fn manifest(&self, repository: &str, reference: &str) -> Result<(Manifest, String)> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_error()?;
        self.lookup(repository, reference).ok_or_else(|| {
            DepotError::not_found("manifest".to_string(), format!("{repository}:{reference}"))
        })
    }

    async fn blob_reader(&self, _repository: &str, digest: &str) -> Result<BlobReader> {
        self.blob_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_error()?;
        let blob = lock(&self.state).blobs.get(digest).cloned();
        blob.map(BlobReader::from_bytes)
            .ok_or_else(|| DepotError::not_found("blob", digest))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.tag_calls.fetch_add(1, Ordering::SeqCst);
        self.check_error()?;
        lock(&self.state)
            .tags
            .get(repository)
            .cloned()
            .ok_or_else(|| DepotError::not_found("repository", repository))
    }

    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
        query: Option<&str>,
    ) -> Result<ReferrersResponse> {
        self.referrer_calls.fetch_add(1, Ordering::SeqCst);
        self.check_error()?;
        let mut state = lock(&self.state);
        state.referrer_queries.push(query.map(str::to_string));
        state
            .referrers
            .get(&(repository.to_string(), digest.to_string()))
            .cloned()
            .ok_or_else(|| DepotError::not_found("referrers", digest))
    }
}

#[derive(Default)]
struct LocalState {
    /// (repository, digest) -> artifact and payload
    manifests: HashMap<(String, String), (LocalArtifact, Manifest)>,
    /// (repository, tag) -> digest
    tags: HashMap<(String, String), String>,
    blobs: HashMap<String, Bytes>,
    next_id: i64,
    deleted_blobs: Vec<String>,
    deleted_manifests: Vec<String>,
    active_pushes: HashMap<String, usize>,
}

/// Local registry double.
#[derive(Default)]
pub(crate) struct FakeLocalStore {
    state: Mutex<LocalState>,
    push_delay: Mutex<Duration>,
    get_error: Mutex<Option<DepotError>>,
    fail_delete: AtomicBool,
    pub push_manifest_calls: AtomicUsize,
    pub push_blob_calls: AtomicUsize,
    pub pull_blob_calls: AtomicUsize,
    /// Highest number of overlapping pushes seen for a single key.
    pub max_overlap: AtomicUsize,
}

impl FakeLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_manifest(state: &mut LocalState, repository: &str, manifest: &Manifest) -> LocalArtifact {
        let digest = manifest.digest();
        let key = (repository.to_string(), digest.clone());
        if let Some((artifact, _)) = state.manifests.get(&key) {
            return artifact.clone();
        }
        state.next_id += 1;
        let artifact = LocalArtifact {
            id: state.next_id,
            repository: repository.to_string(),
            digest,
            media_type: manifest.media_type().to_string(),
        };
        state
            .manifests
            .insert(key, (artifact.clone(), manifest.clone()));
        artifact
    }

    pub fn add_manifest(&self, repository: &str, tag: Option<&str>, manifest: &Manifest) -> LocalArtifact {
        let mut state = lock(&self.state);
        let artifact = Self::store_manifest(&mut state, repository, manifest);
        if let Some(tag) = tag {
            state.tags.insert(
                (repository.to_string(), tag.to_string()),
                artifact.digest.clone(),
            );
        }
        artifact
    }

    pub fn add_blob(&self, data: &[u8]) -> String {
        let digest = sha256_of(data);
        lock(&self.state)
            .blobs
            .insert(digest.clone(), Bytes::copy_from_slice(data));
        digest
    }

    pub fn has_manifest(&self, repository: &str, digest: &str) -> bool {
        lock(&self.state)
            .manifests
            .contains_key(&(repository.to_string(), digest.to_string()))
    }

    pub fn manifest(&self, repository: &str, digest: &str) -> Option<Manifest> {
        lock(&self.state)
            .manifests
            .get(&(repository.to_string(), digest.to_string()))
            .map(|(_, m)| m.clone())
    }

    pub fn manifests_in(&self, repository: &str) -> Vec<Manifest> {
        lock(&self.state)
            .manifests
            .iter()
            .filter(|((repo, _), _)| repo == repository)
            .map(|(_, (_, m))| m.clone())
            .collect()
    }

    pub fn tag_digest(&self, repository: &str, tag: &str) -> Option<String> {
        lock(&self.state)
            .tags
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
    }

    pub fn blob(&self, digest: &str) -> Option<Bytes> {
        lock(&self.state).blobs.get(digest).cloned()
    }

    pub fn deleted_blobs(&self) -> Vec<String> {
        lock(&self.state).deleted_blobs.clone()
    }

    pub fn deleted_manifests(&self) -> Vec<String> {
        lock(&self.state).deleted_manifests.clone()
    }

    pub fn set_push_delay(&self, delay: Duration) {
        *lock(&self.push_delay) = delay;
    }

    pub fn fail_get_with(&self, error: Option<DepotError>) {
        *lock(&self.get_error) = error;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    async fn tracked_push<F: FnOnce(&mut LocalState)>(&self, key: String, apply: F) {
        {
            let mut state = lock(&self.state);
            let active = state.active_pushes.entry(key.clone()).or_insert(0);
            *active += 1;
            self.max_overlap.fetch_max(*active, Ordering::SeqCst);
        }
        let delay = *lock(&self.push_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        apply(&mut state);
        if let Some(active) = state.active_pushes.get_mut(&key) {
            *active -= 1;
        }
    }
}

#[async_trait]
impl LocalStore for FakeLocalStore {
    async fn blob_exist(&self, art: &ArtifactRef) -> Result<bool> {
        Ok(lock(&self.state).blobs.contains_key(&art.digest))
    }

    async fn get_manifest(&self, art: &ArtifactRef) -> Result<Option<LocalArtifact>> {
        if let Some(e) = lock(&self.get_error).clone() {
            return Err(e);
        }
        let state = lock(&self.state);
        let digest = if art.digest.is_empty() {
            match state.tags.get(&(art.repository.clone(), art.tag.clone())) {
                Some(d) => d.clone(),
                None => return Ok(None),
            }
        } else {
            art.digest.clone()
        };
        Ok(state
            .manifests
            .get(&(art.repository.clone(), digest))
            .map(|(a, _)| a.clone()))
    }

    async fn push_blob(&self, repository: &str, digest: &str, blob: BlobReader) -> Result<()> {
        self.push_blob_calls.fetch_add(1, Ordering::SeqCst);
        let data = blob.into_bytes().await?;
        let digest = digest.to_string();
        self.tracked_push(format!("{repository}:{digest}"), move |state| {
            state.blobs.insert(digest, data);
        })
        .await;
        Ok(())
    }

    async fn pull_blob(&self, _repository: &str, digest: &str) -> Result<BlobReader> {
        self.pull_blob_calls.fetch_add(1, Ordering::SeqCst);
        self.blob(digest)
            .map(BlobReader::from_bytes)
            .ok_or_else(|| DepotError::not_found("blob", digest))
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<()> {
        self.push_manifest_calls.fetch_add(1, Ordering::SeqCst);
        let repo = repository.to_string();
        let reference = reference.to_string();
        let manifest = manifest.clone();
        self.tracked_push(format!("{repo}:{reference}"), move |state| {
            let artifact = Self::store_manifest(state, &repo, &manifest);
            if !crate::digest::is_digest(&reference) {
                state.tags.insert((repo, reference), artifact.digest);
            }
        })
        .await;
        Ok(())
    }

    async fn check_dependencies(
        &self,
        _repository: &str,
        manifest: &Manifest,
    ) -> Result<Vec<Descriptor>> {
        let state = lock(&self.state);
        Ok(manifest
            .references()
            .into_iter()
            .filter(|d| !state.blobs.contains_key(&d.digest().to_string()))
            .collect())
    }

    async fn delete_blob(&self, digest: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.deleted_blobs.push(digest.to_string());
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(DepotError::network("delete failed"));
        }
        state.blobs.remove(digest);
        Ok(())
    }

    async fn delete_manifest(&self, digest: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let before = state.manifests.len();
        state.manifests.retain(|(_, d), _| d != digest);
        state.tags.retain(|_, d| d != digest);
        if state.manifests.len() != before {
            state.deleted_manifests.push(digest.to_string());
        }
        Ok(())
    }
}

/// Records tag bindings instead of writing them anywhere.
#[derive(Default)]
pub(crate) struct FakeTagController {
    /// (repository, tag, digest)
    bindings: Mutex<Vec<(String, String, String)>>,
    pub pull_time_updates: AtomicUsize,
}

impl FakeTagController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        lock(&self.bindings).clone()
    }

    pub fn bound_digest(&self, repository: &str, tag: &str) -> Option<String> {
        lock(&self.bindings)
            .iter()
            .rev()
            .find(|(r, t, _)| r == repository && t == tag)
            .map(|(_, _, d)| d.clone())
    }
}

#[async_trait]
impl TagController for FakeTagController {
    async fn ensure_tag(&self, artifact: &LocalArtifact, tag: &str) -> Result<()> {
        lock(&self.bindings).push((
            artifact.repository.clone(),
            tag.to_string(),
            artifact.digest.clone(),
        ));
        Ok(())
    }

    async fn update_pull_time(&self, _artifact: &LocalArtifact, _tag: &str) -> Result<()> {
        self.pull_time_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeEventSink {
    events: Mutex<Vec<PullEvent>>,
}

impl FakeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PullEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl EventSink for FakeEventSink {
    async fn pull_artifact(&self, event: PullEvent) {
        lock(&self.events).push(event);
    }
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

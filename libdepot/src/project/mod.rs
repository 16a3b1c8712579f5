//! Projects and the upstream registries behind proxy projects.

use crate::auth::Credentials;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;


/// Flavour of an upstream registry. Docker Hub gets the implicit `library/`
/// namespace for single-segment image names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistryKind {
    DockerHub,
    #[default]
    Generic,
}

/// Connection settings for an upstream registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub id: i64,
    pub url: String,
    pub kind: RegistryKind,
    pub credentials: Credentials,
    /// Skip TLS certificate verification.
    pub insecure: bool,
}

impl RegistrySettings {
    pub fn new(id: i64, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            kind: RegistryKind::Generic,
            credentials: Credentials::Anonymous,
            insecure: false,
        }
    }

    pub fn with_kind(mut self, kind: RegistryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

/// Project metadata key enabling referrers API proxying.
pub const METADATA_PROXY_REFERRER_API: &str = "proxy_referrer_api";
/// Project metadata key holding the upstream bandwidth cap in KiB/s.
pub const METADATA_PROXY_SPEED_KB: &str = "proxy_speed_kb";

/// A local namespace. Projects with a registry are proxy projects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub registry: Option<RegistrySettings>,
    /// Forward `GET /v2/<name>/referrers/<digest>` upstream.
    pub proxy_referrer_api: bool,
    /// Upstream bandwidth cap in KiB/s. `None` is unlimited.
    pub proxy_speed_kb: Option<u32>,
}

impl Project {
    pub fn local(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            registry: None,
            proxy_referrer_api: false,
            proxy_speed_kb: None,
        }
    }

    pub fn proxy(id: i64, name: impl Into<String>, registry: RegistrySettings) -> Self {
        Self {
            registry: Some(registry),
            ..Self::local(id, name)
        }
    }

    pub fn with_referrer_api(mut self, enabled: bool) -> Self {
        self.proxy_referrer_api = enabled;
        self
    }

    /// Caps upstream reads at `kb` KiB/s. Zero removes the cap.
    pub fn with_speed_limit_kb(mut self, kb: u32) -> Self {
        self.proxy_speed_kb = (kb > 0).then_some(kb);
        self
    }

    /// Applies string metadata as the project API stores it. Unknown keys
    /// are ignored; a speed of `-1` or anything unparsable means unlimited.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::project::{Project, RegistrySettings};
    ///
    /// let project = Project::proxy(3, "proxy-cache", RegistrySettings::new(1, "https://ghcr.io"))
    ///     .with_metadata([("proxy_referrer_api", "true"), ("proxy_speed_kb", "100")]);
    /// assert!(project.referrer_api_enabled());
    /// assert_eq!(project.proxy_cache_speed(), Some(100));
    /// ```
    pub fn with_metadata<'a>(mut self, metadata: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        for (key, value) in metadata {
            match key {
                METADATA_PROXY_REFERRER_API => {
                    self.proxy_referrer_api = value.trim().eq_ignore_ascii_case("true")
                }
                METADATA_PROXY_SPEED_KB => {
                    self.proxy_speed_kb = value.trim().parse::<u32>().ok().filter(|kb| *kb > 0)
                }
                _ => {}
            }
        }
        self
    }

    pub fn is_proxy(&self) -> bool {
        self.registry.is_some()
    }

    /// True for proxy projects that forward referrers requests upstream.
    pub fn referrer_api_enabled(&self) -> bool {
        self.is_proxy() && self.proxy_referrer_api
    }

    /// Upstream bandwidth cap in KiB/s, if any.
    pub fn proxy_cache_speed(&self) -> Option<u32> {
        self.proxy_speed_kb.filter(|_| self.is_proxy())
    }

    /// Returns the canonical path for `repository` when the upstream is
    /// Docker Hub and the image name has no namespace, e.g.
    /// `proxy/hello` becomes `proxy/library/hello`.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::project::{Project, RegistryKind, RegistrySettings};
    ///
    /// let hub = RegistrySettings::new(1, "https://registry-1.docker.io")
    ///     .with_kind(RegistryKind::DockerHub);
    /// let project = Project::proxy(1, "proxy", hub);
    /// assert_eq!(
    ///     project.default_library_repository("proxy/hello").as_deref(),
    ///     Some("proxy/library/hello")
    /// );
    /// assert_eq!(project.default_library_repository("proxy/library/hello"), None);
    /// ```
    pub fn default_library_repository(&self, repository: &str) -> Option<String> {
        let registry = self.registry.as_ref()?;
        if registry.kind != RegistryKind::DockerHub {
            return None;
        }
        let name = repository
            .strip_prefix(&self.name)
            .and_then(|rest| rest.strip_prefix('/'))?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(format!("{}/library/{}", self.name, name))
    }
}

/// Looks up projects by name.
#[async_trait]
pub trait ProjectStore: Send + Sync + 'static {
    async fn get_by_name(&self, name: &str) -> Result<Option<Project>>;
}

/// Project store backed by a map, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: Project) {
        let mut projects = self
            .projects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        projects.insert(project.name.clone(), project);
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get_by_name(&self, name: &str) -> Result<Option<Project>> {
        let projects = self
            .projects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(projects.get(name).cloned())
    }
}

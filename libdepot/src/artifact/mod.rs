//! Artifact identities carried through the proxy cache.
//!
//! An [`ArtifactRef`] names what a client asked for, a [`ManifestDescriptor`]
//! is what upstream says about it, and a [`LocalArtifact`] is what the local
//! registry already holds. [`V2Route`] parses OCI Distribution paths into
//! those identities.

use crate::digest::is_digest;
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(test)]
mod tests;

/// A client request for a manifest or blob in some project.
///
/// Exactly one of `tag` / `digest` is populated by the caller; the digest is
/// the canonical cache key once known and tags are aliases that may rebind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    /// The local namespace the client used.
    pub project_name: String,
    /// Full repository path including the project name.
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

impl ArtifactRef {
    /// Builds a reference from a repository path and a tag-or-digest string.
    ///
    /// The project name is the first path segment of `repository`.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::ArtifactRef;
    ///
    /// let art = ArtifactRef::parse("proxy/library/hello", "latest");
    /// assert_eq!(art.project_name, "proxy");
    /// assert_eq!(art.tag, "latest");
    /// assert_eq!(art.remote_repository(), "library/hello");
    /// ```
    pub fn parse(repository: &str, reference: &str) -> Self {
        let project_name = repository.split('/').next().unwrap_or_default();
        let mut art = Self {
            project_name: project_name.to_string(),
            repository: repository.to_string(),
            ..Default::default()
        };
        if is_digest(reference) {
            art.digest = reference.to_string();
        } else {
            art.tag = reference.to_string();
        }
        art
    }

    /// Returns a copy of this reference pointing at `digest`.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            ..self.clone()
        }
    }

    /// Returns a copy of this reference with only `tag` set.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            digest: String::new(),
            ..self.clone()
        }
    }

    /// The digest if known, otherwise the tag.
    pub fn reference(&self) -> &str {
        if self.digest.is_empty() {
            &self.tag
        } else {
            &self.digest
        }
    }

    /// Repository path on the upstream registry: the local repository with
    /// the project prefix removed.
    pub fn remote_repository(&self) -> &str {
        self.repository
            .strip_prefix(&self.project_name)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(&self.repository)
    }

    /// Singleflight / inflight key for this artifact's remote identity.
    pub fn remote_key(&self) -> String {
        format!("{}:{}", self.remote_repository(), self.reference())
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.digest.is_empty() {
            write!(f, "{}:{}", self.repository, self.tag)
        } else {
            write!(f, "{}@{}", self.repository, self.digest)
        }
    }
}

/// What upstream reports for a manifest `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// An artifact already present in the local registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalArtifact {
    pub id: i64,
    pub repository: String,
    pub digest: String,
    pub media_type: String,
}

/// An OCI Distribution v2 request path, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V2Route {
    /// `/v2/<name>/manifests/<reference>`
    Manifest { name: String, reference: String },
    /// `/v2/<name>/blobs/<digest>`
    Blob { name: String, digest: String },
    /// `/v2/<name>/blobs/uploads/...`
    BlobUpload { name: String },
    /// `/v2/<name>/tags/list`
    TagList { name: String },
    /// `/v2/<name>/referrers/<digest>`
    Referrers { name: String, digest: String },
}

impl V2Route {
    const V2_PREFIX: &'static str = "/v2/";
    const MANIFESTS: &'static str = "/manifests/";
    const BLOB_UPLOADS: &'static str = "/blobs/uploads";
    const BLOBS: &'static str = "/blobs/";
    const TAG_LIST: &'static str = "/tags/list";
    const REFERRERS: &'static str = "/referrers/";

    /// Parses a request path. Returns `None` for anything that is not a
    /// manifest, blob, upload, tag-list or referrers path.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::artifact::V2Route;
    ///
    /// let route = V2Route::parse("/v2/proxy/library/hello/manifests/latest").unwrap();
    /// assert_eq!(route.name(), "proxy/library/hello");
    /// ```
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(Self::V2_PREFIX)?;
        let rest = format!("/{}", rest);

        if let Some(name) = rest.strip_suffix(Self::TAG_LIST) {
            return Self::clean_name(name).map(|name| V2Route::TagList { name });
        }
        if let Some(idx) = rest.find(Self::BLOB_UPLOADS) {
            return Self::clean_name(&rest[..idx]).map(|name| V2Route::BlobUpload { name });
        }
        if let Some(idx) = rest.rfind(Self::REFERRERS) {
            let digest = &rest[idx + Self::REFERRERS.len()..];
            if !digest.is_empty() && !digest.contains('/') {
                return Self::clean_name(&rest[..idx]).map(|name| V2Route::Referrers {
                    name,
                    digest: digest.to_string(),
                });
            }
        }
        if let Some(idx) = rest.rfind(Self::MANIFESTS) {
            let reference = &rest[idx + Self::MANIFESTS.len()..];
            if reference.is_empty() || reference.contains('/') {
                return None;
            }
            return Self::clean_name(&rest[..idx]).map(|name| V2Route::Manifest {
                name,
                reference: reference.to_string(),
            });
        }
        if let Some(idx) = rest.rfind(Self::BLOBS) {
            let digest = &rest[idx + Self::BLOBS.len()..];
            if digest.is_empty() || digest.contains('/') {
                return None;
            }
            return Self::clean_name(&rest[..idx]).map(|name| V2Route::Blob {
                name,
                digest: digest.to_string(),
            });
        }
        None
    }

    fn clean_name(raw: &str) -> Option<String> {
        let name = raw.trim_matches('/');
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Repository name the route addresses.
    pub fn name(&self) -> &str {
        match self {
            V2Route::Manifest { name, .. }
            | V2Route::Blob { name, .. }
            | V2Route::BlobUpload { name }
            | V2Route::TagList { name }
            | V2Route::Referrers { name, .. } => name,
        }
    }

    /// Project the route addresses: the first segment of the name.
    pub fn project_name(&self) -> &str {
        self.name().split('/').next().unwrap_or_default()
    }

    /// Artifact reference for manifest, blob and referrers routes.
    pub fn artifact(&self) -> Option<ArtifactRef> {
        match self {
            V2Route::Manifest { name, reference } => Some(ArtifactRef::parse(name, reference)),
            V2Route::Blob { name, digest } | V2Route::Referrers { name, digest } => {
                Some(ArtifactRef::parse(name, digest))
            }
            _ => None,
        }
    }
}

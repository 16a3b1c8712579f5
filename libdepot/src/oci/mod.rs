//! OCI manifest payloads as the proxy cache handles them.
//!
//! A [`Manifest`] keeps the exact bytes upstream served (so digests stay
//! stable) next to the parsed structure from the `oci-spec` crate, which is
//! used to enumerate referenced descriptors and to prune manifest lists.

pub use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};

use crate::digest::sha256_of;
use crate::error::{DepotError, Result};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashSet;


pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// `Accept` header value sent upstream for manifest requests.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Returns true for media types that reference other manifests.
pub fn is_list_media_type(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX || media_type == DOCKER_MANIFEST_LIST
}

/// Represents either a single-platform image manifest or a multi-platform image index.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum ManifestOrIndex {
    /// A single-platform image manifest
    Manifest(ImageManifest),
    /// A multi-platform image index (or Docker manifest list)
    Index(ImageIndex),
}

impl ManifestOrIndex {
    /// Parse manifest bytes, using `media_type` when known and inspecting the
    /// JSON otherwise.
    pub fn from_bytes(media_type: &str, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DepotError::validation_with_source("Failed to parse manifest JSON", e))?;

        let declared = if media_type.is_empty() {
            value
                .get("mediaType")
                .and_then(|v| v.as_str())
                .unwrap_or("")
        } else {
            media_type
        };

        let is_index = if declared.is_empty() {
            value.get("manifests").is_some()
        } else {
            declared.contains("index") || declared.contains("list")
        };

        if is_index {
            let index: ImageIndex = serde_json::from_value(value)
                .map_err(|e| DepotError::validation_with_source("Failed to parse image index", e))?;
            Ok(ManifestOrIndex::Index(index))
        } else if value.get("layers").is_some() || value.get("config").is_some() {
            let manifest: ImageManifest = serde_json::from_value(value).map_err(|e| {
                DepotError::validation_with_source("Failed to parse image manifest", e)
            })?;
            Ok(ManifestOrIndex::Manifest(manifest))
        } else {
            Err(DepotError::validation(
                "Unable to determine if content is a manifest or index",
            ))
        }
    }

    /// Returns true if this is a multi-platform index.
    pub fn is_index(&self) -> bool {
        matches!(self, ManifestOrIndex::Index(_))
    }

    /// Descriptors this document points at: config and layers for a
    /// manifest, child manifests for an index.
    pub fn references(&self) -> Vec<Descriptor> {
        match self {
            ManifestOrIndex::Manifest(m) => std::iter::once(m.config().clone())
                .chain(m.layers().iter().cloned())
                .collect(),
            ManifestOrIndex::Index(i) => i.manifests().clone(),
        }
    }
}

/// A manifest payload together with its media type.
#[derive(Debug, Clone)]
pub struct Manifest {
    media_type: String,
    payload: Bytes,
    parsed: ManifestOrIndex,
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.media_type == other.media_type && self.payload == other.payload
    }
}

impl Manifest {
    /// Parses a manifest payload.
    ///
    /// When `media_type` is empty, the payload's own `mediaType` field is used.
    pub fn from_bytes(media_type: &str, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let parsed = ManifestOrIndex::from_bytes(media_type, &payload)?;
        let media_type = if media_type.is_empty() {
            match &parsed {
                ManifestOrIndex::Manifest(m) => m
                    .media_type()
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| OCI_IMAGE_MANIFEST.to_string()),
                ManifestOrIndex::Index(i) => i
                    .media_type()
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| OCI_IMAGE_INDEX.to_string()),
            }
        } else {
            media_type.to_string()
        };
        Ok(Self {
            media_type,
            payload,
            parsed,
        })
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// The exact bytes served by upstream (or produced by pruning).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// sha256 digest of the payload.
    pub fn digest(&self) -> String {
        sha256_of(&self.payload)
    }

    pub fn is_list(&self) -> bool {
        self.parsed.is_index()
    }

    /// Descriptors referenced by this manifest.
    pub fn references(&self) -> Vec<Descriptor> {
        self.parsed.references()
    }

    /// Digest strings of the referenced descriptors, in document order.
    pub fn reference_digests(&self) -> Vec<String> {
        self.references()
            .iter()
            .map(|d| d.digest().to_string())
            .collect()
    }

    /// Builds a manifest list holding only the children whose digest is in
    /// `keep`. Every other field of the original document is preserved.
    ///
    /// When every child is kept the original payload is returned untouched,
    /// so its digest does not change.
    pub fn with_children(&self, keep: &HashSet<String>) -> Result<Manifest> {
        if !self.is_list() {
            return Err(DepotError::validation(
                "Only manifest lists can be pruned to a subset of children",
            ));
        }
        if self.reference_digests().iter().all(|d| keep.contains(d)) {
            return Ok(self.clone());
        }

        let mut value: Value = serde_json::from_slice(&self.payload)
            .map_err(|e| DepotError::validation_with_source("Failed to parse manifest JSON", e))?;
        let children = value
            .get_mut("manifests")
            .and_then(|m| m.as_array_mut())
            .ok_or_else(|| DepotError::validation("Manifest list has no manifests array"))?;
        children.retain(|child| {
            child
                .get("digest")
                .and_then(|d| d.as_str())
                .is_some_and(|d| keep.contains(d))
        });

        let payload = serde_json::to_vec(&value)
            .map_err(|e| DepotError::validation_with_source("Failed to serialize manifest list", e))?;
        Manifest::from_bytes(&self.media_type, payload)
    }
}

/// A manifest list payload served from the KV cache instead of the local
/// registry, used while the list itself is not yet published locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedManifestList {
    pub content: Bytes,
    pub digest: String,
    pub content_type: String,
}

//! Depot - pull-through cache for OCI registries
//!
//! Depot lets a local OCI registry act as a mirror of an upstream one. A
//! "proxy project" in the local registry is bound to an upstream registry;
//! pulls from it are served locally when the local copy is current and
//! fetched from upstream otherwise, while the upstream content is written
//! into the local registry in the background.
//!
//! # Quick Start
//!
//! ```no_run
//! use libdepot::controller::{ProxyController, RequestContext};
//! use libdepot::remote::{HttpRemoteFactory, RemoteFactory};
//! use libdepot::{ArtifactRef, Config, LocalStore, RegistrySettings};
//! use std::sync::Arc;
//!
//! # async fn example(local: Arc<dyn LocalStore>) -> libdepot::Result<()> {
//! let config = Config::load(None)?;
//! let remotes = HttpRemoteFactory::from_config(&config);
//! let controller = ProxyController::builder()
//!     .with_config(config)
//!     .with_local_store(local)
//!     .build()
//!     .await?;
//!
//! let remote = remotes.remote_for(&RegistrySettings::new(1, "https://registry-1.docker.io"))?;
//! let art = ArtifactRef::parse("proxy/library/hello", "latest");
//! let manifest = controller
//!     .proxy_manifest(&RequestContext::default(), &art, &remote)
//!     .await?;
//! println!("{}", manifest.digest());
//! # Ok(())
//! # }
//! ```
//!
//! # Main Types
//!
//! - [`ProxyController`] - decides local vs upstream and caches in the background
//! - [`middleware::proxy_middleware`] - axum middleware in front of the local registry
//! - [`LocalStore`] / [`RemoteClient`] - the local and upstream registries
//! - [`KvCache`] - soft cache for manifest list payloads and trimmed digests
//! - [`Config`] - tuning knobs, loaded from YAML
//!
//! The local registry, project lookup, tag binding and pull events are
//! collaborators supplied by the embedding service through traits.

#![warn(clippy::all)]

/// Returns the libdepot crate version.
///
/// # Examples
///
/// ```
/// let version = libdepot::version();
/// assert!(!version.is_empty());
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub use artifact::{ArtifactRef, LocalArtifact, ManifestDescriptor};
pub use auth::{Credentials, Identity};
pub use config::Config;
pub use controller::{ProxyController, RequestContext};
pub use error::{DepotError, Result};
pub use kv::KvCache;
pub use local::LocalStore;
pub use oci::Manifest;
pub use project::{Project, ProjectStore, RegistrySettings};
pub use remote::RemoteClient;

pub mod artifact;
pub mod auth;
pub mod client;
pub mod config;
pub mod controller;
pub mod digest;
pub mod error;
pub mod eviction;
pub mod inflight;
pub mod kv;
pub mod local;
pub mod manifest_cache;
pub mod middleware;
pub mod oci;
pub mod project;
pub mod referrers;
pub mod remote;
pub mod singleflight;

#[cfg(test)]
mod testutil;

//! Proxy cache configuration.
//!
//! This module manages the runtime knobs of the proxy cache with sensible
//! defaults, loading from a YAML file and layering it over the defaults.

use crate::error::{DepotError, Result};
use config::{Config as ConfigRs, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;


/// One week, in seconds.
const ONE_WEEK_SECS: u64 = 7 * 24 * 60 * 60;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub proxy: Proxy,
    #[serde(default)]
    pub kv: Kv,
}

impl Config {
    /// Parses a `Config` from a YAML string.
    ///
    /// This function is primarily used for testing.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let builder = ConfigRs::builder()
            // Add default values
            .add_source(ConfigRs::try_from(&Config::default()).map_err(default_error)?)
            // Merge with YAML string
            .add_source(File::from_str(s, FileFormat::Yaml));

        Self::from_builder(builder, None)
    }

    /// Loads a `Config` from an optional file path.
    ///
    /// Without a path, the defaults are returned. A path that does not exist
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigRs::builder()
            .add_source(ConfigRs::try_from(&Config::default()).map_err(default_error)?);

        if let Some(p) = path {
            builder = builder.add_source(File::from(p).required(true));
        }

        Self::from_builder(builder, path)
    }

    /// Creates a `Config` from a `config::ConfigBuilder` and validates it.
    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        path: Option<&Path>,
    ) -> Result<Self> {
        let config: Config = builder
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| {
                DepotError::config_with_source(
                    "Failed to deserialize configuration".to_string(),
                    path.map(|p| p.display().to_string()),
                    e,
                )
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.trimmed_digest_ttl < self.proxy.manifest_list_cache_ttl {
            return Err(DepotError::config(
                "proxy.trimmed_digest_ttl must not be shorter than proxy.manifest_list_cache_ttl",
                None,
            ));
        }
        if self.proxy.upstream_max_connections == Some(0) {
            return Err(DepotError::config(
                "proxy.upstream_max_connections must be greater than zero when set",
                None,
            ));
        }
        Ok(())
    }
}

fn default_error(e: config::ConfigError) -> DepotError {
    DepotError::config_with_source("Failed to serialize default configuration", None, e)
}

/// Upstream network settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    /// Upstream request timeout in seconds.
    #[serde(default = "default_network_timeout")]
    pub timeout: u64,

    #[serde(default = "default_network_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            timeout: default_network_timeout(),
            max_idle_per_host: default_network_max_idle_per_host(),
        }
    }
}

fn default_network_timeout() -> u64 {
    30
}

fn default_network_max_idle_per_host() -> usize {
    10
}

/// Proxy cache behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proxy {
    /// Polls for pushed children before publishing a manifest list.
    #[serde(default = "default_max_manifest_list_wait")]
    pub max_manifest_list_wait: u32,

    /// Polls for pushed blobs before publishing a manifest.
    #[serde(default = "default_max_manifest_wait")]
    pub max_manifest_wait: u32,

    #[serde(default = "default_sleep_interval_ms")]
    pub sleep_interval_ms: u64,

    /// Seconds a cached manifest list payload stays in the KV cache.
    #[serde(default = "default_manifest_list_cache_ttl")]
    pub manifest_list_cache_ttl: u64,

    /// Seconds a trimmed-digest redirect stays in the KV cache.
    #[serde(default = "default_trimmed_digest_ttl")]
    pub trimmed_digest_ttl: u64,

    #[serde(default = "default_ensure_tag_max_retry")]
    pub ensure_tag_max_retry: u32,

    #[serde(default = "default_ensure_tag_interval_ms")]
    pub ensure_tag_interval_ms: u64,

    /// Serve blobs straight from upstream and cache them in the background.
    #[serde(default)]
    pub async_local_caching: bool,

    /// Bytes of cached blobs to keep before evicting; zero disables eviction.
    #[serde(default)]
    pub lru_max_size_bytes: u64,

    #[serde(default)]
    pub upstream_max_connections: Option<u32>,

    #[serde(default = "default_connection_wait_attempts")]
    pub connection_wait_attempts: u32,

    #[serde(default = "default_connection_wait_interval_ms")]
    pub connection_wait_interval_ms: u64,

    /// Seconds a background cache-fill task may run.
    #[serde(default = "default_background_timeout")]
    pub background_timeout: u64,

    /// Polls for a blob another request is already writing locally before
    /// streaming it from upstream instead.
    #[serde(default = "default_push_wait_attempts")]
    pub push_wait_attempts: u32,

    #[serde(default = "default_push_wait_interval_ms")]
    pub push_wait_interval_ms: u64,

    /// Seconds a proxied referrers response stays in the KV cache.
    #[serde(default = "default_referrer_cache_ttl")]
    pub referrer_cache_ttl: u64,
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            max_manifest_list_wait: default_max_manifest_list_wait(),
            max_manifest_wait: default_max_manifest_wait(),
            sleep_interval_ms: default_sleep_interval_ms(),
            manifest_list_cache_ttl: default_manifest_list_cache_ttl(),
            trimmed_digest_ttl: default_trimmed_digest_ttl(),
            ensure_tag_max_retry: default_ensure_tag_max_retry(),
            ensure_tag_interval_ms: default_ensure_tag_interval_ms(),
            async_local_caching: false,
            lru_max_size_bytes: 0,
            upstream_max_connections: None,
            connection_wait_attempts: default_connection_wait_attempts(),
            connection_wait_interval_ms: default_connection_wait_interval_ms(),
            background_timeout: default_background_timeout(),
            push_wait_attempts: default_push_wait_attempts(),
            push_wait_interval_ms: default_push_wait_interval_ms(),
            referrer_cache_ttl: default_referrer_cache_ttl(),
        }
    }
}

impl Proxy {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn manifest_list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_list_cache_ttl)
    }

    pub fn trimmed_digest_ttl(&self) -> Duration {
        Duration::from_secs(self.trimmed_digest_ttl)
    }

    pub fn ensure_tag_interval(&self) -> Duration {
        Duration::from_millis(self.ensure_tag_interval_ms)
    }

    pub fn connection_wait_interval(&self) -> Duration {
        Duration::from_millis(self.connection_wait_interval_ms)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout)
    }

    pub fn push_wait_interval(&self) -> Duration {
        Duration::from_millis(self.push_wait_interval_ms)
    }

    pub fn referrer_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.referrer_cache_ttl)
    }
}

fn default_max_manifest_list_wait() -> u32 {
    30
}

fn default_max_manifest_wait() -> u32 {
    5
}

fn default_sleep_interval_ms() -> u64 {
    20_000
}

fn default_manifest_list_cache_ttl() -> u64 {
    ONE_WEEK_SECS
}

fn default_trimmed_digest_ttl() -> u64 {
    ONE_WEEK_SECS
}

fn default_ensure_tag_max_retry() -> u32 {
    60
}

fn default_ensure_tag_interval_ms() -> u64 {
    10_000
}

fn default_connection_wait_attempts() -> u32 {
    10
}

fn default_connection_wait_interval_ms() -> u64 {
    500
}

fn default_background_timeout() -> u64 {
    600 // 10 minutes
}

fn default_push_wait_attempts() -> u32 {
    60
}

fn default_push_wait_interval_ms() -> u64 {
    1_000
}

fn default_referrer_cache_ttl() -> u64 {
    60 * 60
}

/// Ephemeral key/value cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Kv {
    #[serde(default = "default_kv_memory_entries")]
    pub memory_entries: usize,
}

impl Default for Kv {
    fn default() -> Self {
        Self {
            memory_entries: default_kv_memory_entries(),
        }
    }
}

fn default_kv_memory_entries() -> usize {
    10000
}

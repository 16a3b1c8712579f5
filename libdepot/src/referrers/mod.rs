//! Upstream responses to the OCI referrers API.
//!
//! A proxy project with `proxy_referrer_api` set answers
//! `GET /v2/<name>/referrers/<digest>` from upstream. Only a few upstream
//! headers are passed on, and the response is kept in the KV cache under
//! [`crate::kv::referrer_key`].

use crate::error::{DepotError, Result};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};


/// Media type of a referrers listing.
pub const REFERRERS_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Upstream headers copied onto a proxied referrers response.
pub const PROXIED_HEADERS: [&str; 3] = ["Content-Type", "Link", "X-Total-Count"];

/// A referrers listing fetched from upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrersResponse {
    /// Allow-listed headers, first value only.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// KV representation; the body is base64 so the entry stays valid JSON.
#[derive(Serialize, Deserialize)]
struct CachedReferrers {
    headers: Vec<(String, String)>,
    body: String,
}

impl ReferrersResponse {
    /// Keeps the first value of each header in [`PROXIED_HEADERS`] and
    /// drops everything else.
    pub fn from_upstream(headers: &HeaderMap, body: Bytes) -> Self {
        let headers = PROXIED_HEADERS
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?.to_str().ok()?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        Self { headers, body }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or(REFERRERS_MEDIA_TYPE)
    }

    pub(crate) fn to_cache_bytes(&self) -> Result<Vec<u8>> {
        let cached = CachedReferrers {
            headers: self.headers.clone(),
            body: general_purpose::STANDARD.encode(&self.body),
        };
        serde_json::to_vec(&cached)
            .map_err(|e| DepotError::validation_with_source("Failed to encode referrers", e))
    }

    pub(crate) fn from_cache_bytes(data: &[u8]) -> Result<Self> {
        let cached: CachedReferrers = serde_json::from_slice(data)
            .map_err(|e| DepotError::validation_with_source("Malformed cached referrers", e))?;
        let body = general_purpose::STANDARD
            .decode(cached.body)
            .map_err(|e| DepotError::validation_with_source("Malformed cached referrers body", e))?;
        Ok(Self {
            headers: cached.headers,
            body: Bytes::from(body),
        })
    }
}

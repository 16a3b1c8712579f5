//! HTTP client for upstream registry communication.
//!
//! This module provides a thin client built on reqwest that implements
//! [`RemoteClient`] against an OCI Distribution v2 endpoint, including the
//! bearer token handshake that public registries require.

use crate::artifact::ManifestDescriptor;
use crate::auth::{AuthChallenge, Credentials, TokenResponse};
use crate::config;
use crate::digest::{is_digest, sha256_of};
use crate::error::{DepotError, Result};
use crate::oci::{MANIFEST_ACCEPT, Manifest};
use crate::referrers::{REFERRERS_MEDIA_TYPE, ReferrersResponse};
use crate::remote::{BlobReader, RemoteClient};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client as ReqwestClient, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;


const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Upper bound on tag list pages followed for one listing.
const MAX_TAG_PAGES: usize = 100;

/// Response from the tags list API endpoint.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    /// Registries return `null` for repositories without tags.
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Configuration for the HTTP client.
///
/// # Examples
///
/// ```
/// use libdepot::client::ClientConfig;
///
/// let config = ClientConfig::new()
///     .with_timeout(60)
///     .with_max_idle_per_host(20);
/// assert_eq!(config.timeout_seconds, 60);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Request timeout in seconds (default: 30)
    pub timeout_seconds: u64,
    /// Maximum idle connections per host (default: 10)
    pub max_idle_per_host: usize,
    /// Accept invalid TLS certificates (default: false)
    pub insecure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_idle_per_host: 10,
            insecure: false,
        }
    }
}

impl From<&config::Network> for ClientConfig {
    fn from(network: &config::Network) -> Self {
        Self {
            timeout_seconds: network.timeout,
            max_idle_per_host: network.max_idle_per_host,
            insecure: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_max_idle_per_host(mut self, max: usize) -> Self {
        self.max_idle_per_host = max;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

/// HTTP client for one upstream registry.
///
/// Bearer tokens obtained from the registry's token service are cached per
/// scope and reused until the registry rejects them.
#[derive(Debug)]
pub struct UpstreamClient {
    http_client: ReqwestClient,
    registry_url: String,
    credentials: Credentials,
    timeout_seconds: u64,
    tokens: Mutex<HashMap<String, String>>,
}

impl UpstreamClient {
    /// Creates a client with default configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::auth::Credentials;
    /// use libdepot::client::UpstreamClient;
    ///
    /// let client = UpstreamClient::new("registry-1.docker.io", Credentials::Anonymous).unwrap();
    /// assert_eq!(client.registry_url(), "https://registry-1.docker.io");
    /// ```
    pub fn new(registry_url: &str, credentials: Credentials) -> Result<Self> {
        Self::with_config(registry_url, credentials, ClientConfig::default())
    }

    pub fn with_config(
        registry_url: &str,
        credentials: Credentials,
        config: ClientConfig,
    ) -> Result<Self> {
        let normalized_url = Self::normalize_url(registry_url)?;

        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| DepotError::network_with_source("Failed to create HTTP client", e))?;

        Ok(Self {
            http_client,
            registry_url: normalized_url,
            credentials,
            timeout_seconds: config.timeout_seconds,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Normalizes a registry URL by ensuring it has a scheme and removing
    /// trailing slashes. Upstreams default to https.
    fn normalize_url(url: &str) -> Result<String> {
        let url = url.trim();

        if url.is_empty() {
            return Err(DepotError::validation("Registry URL cannot be empty"));
        }

        let url = if !url.starts_with("http://") && !url.starts_with("https://") {
            format!("https://{}", url)
        } else {
            url.to_string()
        };

        Ok(url.trim_end_matches('/').to_string())
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    fn pull_scope(repository: &str) -> String {
        format!("repository:{}:pull", repository)
    }

    fn cached_token(&self, scope: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.get(scope).cloned()
    }

    fn authorize(&self, request: RequestBuilder, scope: &str) -> RequestBuilder {
        if let Some(token) = self.cached_token(scope) {
            return request.bearer_auth(token);
        }
        match self.credentials.to_header_value() {
            Some(value) => request.header(header::AUTHORIZATION, value),
            None => request,
        }
    }

    /// Sends a request, answering one bearer challenge if the registry
    /// issues it.
    async fn send(
        &self,
        method: Method,
        url: &str,
        scope: &str,
        accept: Option<&str>,
    ) -> Result<Response> {
        let build = |method: Method| {
            let request = self.http_client.request(method, url);
            match accept {
                Some(accept) => request.header(header::ACCEPT, accept),
                None => request,
            }
        };

        let response = self
            .authorize(build(method.clone()), scope)
            .send()
            .await
            .map_err(|e| self.translate_reqwest_error(e))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| AuthChallenge::parse(v).ok())
            .filter(AuthChallenge::is_bearer);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let token = self.fetch_token(&challenge, scope).await?;
        {
            let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
            tokens.insert(scope.to_string(), token.clone());
        }

        build(method)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.translate_reqwest_error(e))
    }

    async fn fetch_token(&self, challenge: &AuthChallenge, scope: &str) -> Result<String> {
        tracing::debug!(realm = %challenge.realm, scope, "requesting upstream bearer token");

        let mut request = self
            .http_client
            .get(&challenge.realm)
            .query(&challenge.token_query(scope));
        if let Credentials::Basic { username, password } = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.translate_reqwest_error(e))?;
        let response = Self::check_response_status(response, "token", &challenge.realm).await?;
        let body: TokenResponse = response.json().await.map_err(|e| {
            DepotError::validation_with_source("Failed to parse token response", e)
        })?;
        body.into_token()
    }

    fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Media type from a Content-Type header, without parameters.
    fn media_type(headers: &HeaderMap) -> String {
        Self::header_str(headers, header::CONTENT_TYPE.as_str())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    }

    /// Extracts the next page URL from the Link header.
    ///
    /// The OCI Distribution Specification uses the Link header for pagination:
    /// `Link: </v2/alpine/tags/list?n=100&last=3.18>; rel="next"`
    fn extract_next_link(headers: &HeaderMap) -> Option<String> {
        let link_str = Self::header_str(headers, header::LINK.as_str())?;

        for link_part in link_str.split(',') {
            let link_part = link_part.trim();

            if link_part.contains("rel=\"next\"") || link_part.contains("rel='next'") {
                if let Some(start) = link_part.find('<')
                    && let Some(len) = link_part[start + 1..].find('>')
                {
                    return Some(link_part[start + 1..start + 1 + len].to_string());
                }
            }
        }

        None
    }

    /// Resolves a pagination link against the registry. Links to another
    /// origin yield `None` so that credentials never leave the registry.
    fn next_page_url(&self, link: &str) -> Option<String> {
        let base = reqwest::Url::parse(&self.registry_url).ok()?;
        let next = base.join(link).ok()?;
        (next.origin() == base.origin()).then(|| next.to_string())
    }

    /// Parses a Retry-After header given either as seconds or as an HTTP date.
    fn parse_retry_after(value: &str) -> Option<u64> {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(seconds);
        }
        let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
        let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
        u64::try_from(delta.num_seconds()).ok().filter(|s| *s > 0)
    }

    fn translate_reqwest_error(&self, error: reqwest::Error) -> DepotError {
        if error.is_timeout() {
            DepotError::network(format!(
                "Request to {} timed out after {} seconds",
                self.registry_url, self.timeout_seconds
            ))
        } else if error.is_connect() {
            DepotError::network_with_source(
                format!("Failed to connect to registry at {}", self.registry_url),
                error,
            )
        } else {
            DepotError::network_with_source(
                format!("Network error communicating with {}", self.registry_url),
                error,
            )
        }
    }

    /// Checks the HTTP response status and translates errors to DepotError.
    async fn check_response_status(
        response: Response,
        resource_type: &str,
        name: &str,
    ) -> Result<Response> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let retry_after = Self::header_str(response.headers(), header::RETRY_AFTER.as_str())
            .and_then(Self::parse_retry_after);
        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("(unable to read response body)"));

        match status {
            StatusCode::UNAUTHORIZED => Err(DepotError::authentication(
                format!("Authentication required for {}: {}", url, error_body),
                Some(401),
            )),
            StatusCode::FORBIDDEN => Err(DepotError::authentication(
                format!("Access forbidden for {}: {}", url, error_body),
                Some(403),
            )),
            StatusCode::NOT_FOUND => Err(DepotError::not_found(resource_type, name)),
            StatusCode::TOO_MANY_REQUESTS => Err(DepotError::rate_limit(
                format!("Rate limit exceeded for {}", url),
                retry_after,
            )),
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Err(DepotError::server(
                format!("Server error from {}: {}", url, error_body),
                status.as_u16(),
            )),
            _ => Err(DepotError::network(format!(
                "HTTP {} from {}: {}",
                status.as_u16(),
                url,
                error_body
            ))),
        }
    }
}

#[async_trait]
impl RemoteClient for UpstreamClient {
    async fn manifest_exist(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<ManifestDescriptor>> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, reference
        );
        let response = self
            .send(
                Method::HEAD,
                &url,
                &Self::pull_scope(repository),
                Some(MANIFEST_ACCEPT),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let name = format!("{}:{}", repository, reference);
        let response = Self::check_response_status(response, "manifest", &name).await?;

        let headers = response.headers();
        let digest = match Self::header_str(headers, DOCKER_CONTENT_DIGEST) {
            Some(digest) => digest.to_string(),
            None if is_digest(reference) => reference.to_string(),
            None => {
                return Err(DepotError::validation(
                    "Response missing Docker-Content-Digest header",
                ));
            }
        };
        // HEAD responses have no body, so read the advertised length directly.
        let size = Self::header_str(headers, header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Some(ManifestDescriptor {
            media_type: Self::media_type(headers),
            digest,
            size,
        }))
    }

    async fn manifest(&self, repository: &str, reference: &str) -> Result<(Manifest, String)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url, repository, reference
        );
        let response = self
            .send(
                Method::GET,
                &url,
                &Self::pull_scope(repository),
                Some(MANIFEST_ACCEPT),
            )
            .await?;
        let name = format!("{}:{}", repository, reference);
        let response = Self::check_response_status(response, "manifest", &name).await?;

        let media_type = Self::media_type(response.headers());
        let header_digest =
            Self::header_str(response.headers(), DOCKER_CONTENT_DIGEST).map(str::to_string);

        let payload = response.bytes().await.map_err(|e| {
            DepotError::network_with_source("Failed to read manifest response", e)
        })?;

        let computed = sha256_of(&payload);
        if is_digest(reference) && reference != computed {
            return Err(DepotError::validation(format!(
                "Manifest digest mismatch: expected {}, computed {}",
                reference, computed
            )));
        }
        let digest = header_digest.unwrap_or(computed);

        let manifest = Manifest::from_bytes(&media_type, payload)?;
        Ok((manifest, digest))
    }

    async fn blob_reader(&self, repository: &str, digest: &str) -> Result<BlobReader> {
        let url = format!("{}/v2/{}/blobs/{}", self.registry_url, repository, digest);
        let response = self
            .send(Method::GET, &url, &Self::pull_scope(repository), None)
            .await?;
        let name = format!("{}@{}", repository, digest);
        let response = Self::check_response_status(response, "blob", &name).await?;

        let size = response
            .content_length()
            .ok_or_else(|| DepotError::validation("Blob response missing Content-Length"))?;
        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| DepotError::network_with_source("Failed to read blob stream", e))
        });

        Ok(BlobReader::new(size, Box::pin(stream)))
    }

    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
        query: Option<&str>,
    ) -> Result<ReferrersResponse> {
        let mut url = format!(
            "{}/v2/{}/referrers/{}",
            self.registry_url, repository, digest
        );
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        let response = self
            .send(
                Method::GET,
                &url,
                &Self::pull_scope(repository),
                Some(REFERRERS_MEDIA_TYPE),
            )
            .await?;
        let name = format!("{}@{}", repository, digest);
        let response = Self::check_response_status(response, "referrers", &name).await?;

        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            DepotError::network_with_source("Failed to read referrers response", e)
        })?;
        Ok(ReferrersResponse::from_upstream(&headers, body))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let scope = Self::pull_scope(repository);
        let mut all_tags = Vec::new();
        let mut url = format!("{}/v2/{}/tags/list", self.registry_url, repository);
        let mut visited = HashSet::from([url.clone()]);

        for page in 1..=MAX_TAG_PAGES {
            let response = self.send(Method::GET, &url, &scope, None).await?;

            let next_link = Self::extract_next_link(response.headers());
            let response = Self::check_response_status(response, "repository", repository).await?;

            let tags_response: TagsResponse = response.json().await.map_err(|e| {
                DepotError::validation_with_source("Failed to parse tags response", e)
            })?;
            all_tags.extend(tags_response.tags.unwrap_or_default());

            let Some(link) = next_link else {
                break;
            };
            match self.next_page_url(&link) {
                Some(next) if visited.insert(next.clone()) => url = next,
                Some(next) => {
                    tracing::warn!(repository, url = %next, "tag list links back to a page already read");
                    break;
                }
                None => {
                    tracing::warn!(repository, link = %link, "not following tag list link to another host");
                    break;
                }
            }
            if page == MAX_TAG_PAGES {
                tracing::warn!(repository, pages = MAX_TAG_PAGES, "tag list truncated at page limit");
            }
        }

        Ok(all_tags)
    }
}

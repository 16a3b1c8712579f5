//! axum middleware that puts the proxy cache in front of a local registry.
//!
//! [`proxy_middleware`] sits above the handler that serves the local
//! registry. Requests for proxy projects are answered from upstream when the
//! local copy is missing or stale; everything else, and any request the
//! proxy cannot serve because upstream is flaky, is passed to the inner
//! handler unchanged. Referrers requests are forwarded upstream only for
//! projects that enable it, and a project's bandwidth cap applies to every
//! blob it pulls from upstream.
//!
//! ```no_run
//! use axum::{Router, middleware, routing::any};
//! use libdepot::middleware::{ProxyState, proxy_middleware};
//!
//! # fn example(state: ProxyState, local: axum::routing::MethodRouter) -> Router {
//! Router::new()
//!     .route("/v2/{*path}", local)
//!     .layer(middleware::from_fn_with_state(state, proxy_middleware))
//! # }
//! ```

use crate::artifact::{ArtifactRef, V2Route};
use crate::auth::Identity;
use crate::controller::{ManifestDecision, ProxyController, RequestContext};
use crate::digest::Digest;
use crate::error::{DepotError, Result};
use crate::project::{Project, ProjectStore};
use crate::remote::{BlobReader, RemoteClient, RemoteFactory, ThrottledRemote};
use axum::Json;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LOCATION, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Instrument;


const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const OCTET_STREAM: &str = "application/octet-stream";

/// Shared state for [`proxy_middleware`].
#[derive(Clone)]
pub struct ProxyState {
    controller: ProxyController,
    projects: Arc<dyn ProjectStore>,
    remotes: Arc<dyn RemoteFactory>,
}

impl ProxyState {
    pub fn new(
        controller: ProxyController,
        projects: Arc<dyn ProjectStore>,
        remotes: Arc<dyn RemoteFactory>,
    ) -> Self {
        Self {
            controller,
            projects,
            remotes,
        }
    }

    pub fn controller(&self) -> &ProxyController {
        &self.controller
    }
}

/// OCI Distribution error codes sent in error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCode {
    ManifestUnknown,
    BlobUnknown,
    NameUnknown,
    TooManyRequests,
    Denied,
    Unknown,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::ManifestUnknown => "MANIFEST_UNKNOWN",
            Self::BlobUnknown => "BLOB_UNKNOWN",
            Self::NameUnknown => "NAME_UNKNOWN",
            Self::TooManyRequests => "TOOMANYREQUESTS",
            Self::Denied => "DENIED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorBody>,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Body of `GET /v2/<name>/tags/list`.
#[derive(Debug, Serialize, Deserialize)]
struct TagList {
    name: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Routes OCI Distribution requests for proxy projects through the
/// [`ProxyController`].
///
/// The caller's [`Identity`] is read from the request extensions, so an
/// authentication layer must run before this one. Requests without one are
/// treated as anonymous.
pub async fn proxy_middleware(
    State(state): State<ProxyState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(route) = V2Route::parse(req.uri().path()) else {
        return next.run(req).await;
    };

    let project = match state.projects.get_by_name(route.project_name()).await {
        Ok(Some(project)) if project.is_proxy() => project,
        Ok(_) => return next.run(req).await,
        Err(err) => {
            tracing::error!(project = route.project_name(), error = %err, "project lookup failed");
            return error_response(&err, ErrorCode::NameUnknown);
        }
    };

    let identity = req
        .extensions()
        .get::<Identity>()
        .cloned()
        .unwrap_or_default();
    let method = req.method().clone();

    if is_push(&route, &method) {
        if identity.is_proxy_session(&project.name) {
            return next.run(req).await;
        }
        tracing::info!(
            repository = route.name(),
            operator = identity.name(),
            "rejected push to proxy project"
        );
        let err = DepotError::denied(format!(
            "can not push artifact to a proxy project: {}",
            project.name
        ));
        return error_response(&err, ErrorCode::Denied);
    }

    let span = tracing::info_span!(
        "proxy",
        repository = route.name(),
        method = %method,
        operator = identity.name()
    );
    let ctx = RequestContext::new(identity).with_span(span.clone());

    async move {
        let remote = match remote_for(&state, &project) {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(error = %err, "no upstream client, serving locally");
                return next.run(req).await;
            }
        };
        match (&route, method) {
            (V2Route::Blob { .. }, Method::GET) => {
                serve_blob(&state, &ctx, &route, &remote, req, next).await
            }
            (V2Route::Manifest { reference, .. }, method @ (Method::GET | Method::HEAD)) => {
                if let Some(canonical) = project.default_library_repository(route.name()) {
                    return redirect(&canonical, reference);
                }
                let head = method == Method::HEAD;
                serve_manifest(&state, &ctx, &route, &remote, head, req, next).await
            }
            (V2Route::TagList { name }, Method::GET) => {
                let art = ArtifactRef::parse(name, "");
                list_tags(&ctx, &art, &remote, req, next).await
            }
            (V2Route::Referrers { .. }, Method::GET) if project.referrer_api_enabled() => {
                serve_referrers(&state, &ctx, &route, &remote, req, next).await
            }
            _ => next.run(req).await,
        }
    }
    .instrument(span)
    .await
}

fn is_push(route: &V2Route, method: &Method) -> bool {
    match route {
        V2Route::BlobUpload { .. } => !matches!(*method, Method::GET | Method::HEAD),
        V2Route::Manifest { .. } => *method == Method::PUT,
        _ => false,
    }
}

fn remote_for(state: &ProxyState, project: &Project) -> Result<Arc<dyn RemoteClient>> {
    let registry = project.registry.as_ref().ok_or_else(|| {
        DepotError::config(
            format!("project {} has no upstream registry", project.name),
            None,
        )
    })?;
    let remote = state.remotes.remote_for(registry)?;
    Ok(match project.proxy_cache_speed() {
        Some(kb) => Arc::new(ThrottledRemote::new(remote, kb)),
        None => remote,
    })
}

async fn serve_blob(
    state: &ProxyState,
    ctx: &RequestContext,
    route: &V2Route,
    remote: &Arc<dyn RemoteClient>,
    req: Request,
    next: Next,
) -> Response {
    // malformed digests are left to the local registry to reject
    let Some(art) = route
        .artifact()
        .filter(|art| art.digest.parse::<Digest>().is_ok())
    else {
        return next.run(req).await;
    };
    if state.controller.use_local_blob(ctx, &art).await {
        return next.run(req).await;
    }

    match state.controller.proxy_blob(ctx, &art, remote).await {
        Ok(reader) => {
            let headers = content_headers(Some(OCTET_STREAM), &art.digest, reader.size);
            (StatusCode::OK, headers, Body::from_stream(checked_stream(reader))).into_response()
        }
        Err(err) if err.is_not_found() || err.is_rate_limit() => {
            error_response(&err, ErrorCode::BlobUnknown)
        }
        Err(err) => {
            tracing::warn!(digest = %art.digest, error = %err, "proxy blob failed, serving locally");
            next.run(req).await
        }
    }
}

async fn serve_manifest(
    state: &ProxyState,
    ctx: &RequestContext,
    route: &V2Route,
    remote: &Arc<dyn RemoteClient>,
    head: bool,
    req: Request,
    next: Next,
) -> Response {
    let Some(art) = route.artifact() else {
        return next.run(req).await;
    };
    let controller = &state.controller;

    let decision = match controller.use_local_manifest(ctx, &art, remote).await {
        Ok(decision) => decision,
        Err(err) if err.is_not_found() || err.is_rate_limit() => {
            return error_response(&err, ErrorCode::ManifestUnknown);
        }
        Err(err) => {
            tracing::warn!(artifact = %art, error = %err, "manifest lookup failed, serving locally");
            return next.run(req).await;
        }
    };

    match decision {
        ManifestDecision::UseLocal => next.run(req).await,
        ManifestDecision::UseCachedList(list) => {
            tracing::debug!(artifact = %art, digest = %list.digest, "serving cached manifest list");
            let size = list.content.len() as u64;
            let headers = content_headers(Some(list.content_type.as_str()), &list.digest, size);
            let body = if head {
                Body::empty()
            } else {
                Body::from(list.content)
            };
            (StatusCode::OK, headers, body).into_response()
        }
        ManifestDecision::UseRemote if head => {
            match controller.head_manifest(ctx, &art, remote).await {
                Ok(Some(desc)) => {
                    if !art.tag.is_empty() {
                        controller.spawn_ensure_tag(
                            ctx,
                            art.with_digest(desc.digest.clone()),
                            art.tag.clone(),
                        );
                    }
                    let headers = content_headers(Some(desc.media_type.as_str()), &desc.digest, desc.size);
                    (StatusCode::OK, headers, Body::empty()).into_response()
                }
                Ok(None) => {
                    let err = DepotError::not_found("manifest".to_string(), art.to_string());
                    error_response(&err, ErrorCode::ManifestUnknown)
                }
                Err(err) => remote_failure(err, &art, req, next).await,
            }
        }
        ManifestDecision::UseRemote => match controller.proxy_manifest(ctx, &art, remote).await {
            Ok(manifest) => {
                let payload = manifest.payload().clone();
                let headers = content_headers(
                    Some(manifest.media_type()),
                    &manifest.digest(),
                    payload.len() as u64,
                );
                (StatusCode::OK, headers, Body::from(payload)).into_response()
            }
            Err(err) => remote_failure(err, &art, req, next).await,
        },
    }
}

/// Upstream's referrers listing, with only the allow-listed headers.
/// Failures fall back to the local registry's own listing.
async fn serve_referrers(
    state: &ProxyState,
    ctx: &RequestContext,
    route: &V2Route,
    remote: &Arc<dyn RemoteClient>,
    req: Request,
    next: Next,
) -> Response {
    let Some(art) = route
        .artifact()
        .filter(|art| art.digest.parse::<Digest>().is_ok())
    else {
        return next.run(req).await;
    };
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let referrers = match state
        .controller
        .proxy_referrers(ctx, &art, &request_uri, remote)
        .await
    {
        Ok(referrers) => referrers,
        Err(err) => {
            tracing::warn!(artifact = %art, error = %err, "proxy referrers failed, serving locally");
            return next.run(req).await;
        }
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &referrers.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(crate::referrers::REFERRERS_MEDIA_TYPE),
        );
    }
    (StatusCode::OK, headers, Body::from(referrers.body)).into_response()
}

async fn remote_failure(err: DepotError, art: &ArtifactRef, req: Request, next: Next) -> Response {
    if err.is_not_found() || err.is_rate_limit() {
        return error_response(&err, ErrorCode::ManifestUnknown);
    }
    tracing::warn!(artifact = %art, error = %err, "proxy manifest failed, serving locally");
    next.run(req).await
}

/// Merges the local tag list with upstream's. Upstream failures leave the
/// local response untouched.
async fn list_tags(
    ctx: &RequestContext,
    art: &ArtifactRef,
    remote: &Arc<dyn RemoteClient>,
    req: Request,
    next: Next,
) -> Response {
    let local = next.run(req).await;
    let status = local.status();
    if status != StatusCode::OK && status != StatusCode::NOT_FOUND {
        return local;
    }

    let upstream = match ctx.run(remote.list_tags(art.remote_repository())).await {
        Ok(tags) => tags,
        Err(err) => {
            tracing::warn!(error = %err, "upstream tag list failed, serving local tags");
            return local;
        }
    };

    let mut tags = if status == StatusCode::OK {
        match axum::body::to_bytes(local.into_body(), usize::MAX).await {
            Ok(body) => parse_tags(&body),
            Err(err) => {
                tracing::warn!(error = %err, "unreadable local tag list");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };
    tags.extend(upstream);
    tags.sort();
    tags.dedup();

    Json(TagList {
        name: art.repository.clone(),
        tags: Some(tags),
    })
    .into_response()
}

fn parse_tags(body: &Bytes) -> Vec<String> {
    match serde_json::from_slice::<TagList>(body) {
        Ok(list) => list.tags.unwrap_or_default(),
        Err(err) => {
            tracing::warn!(error = %err, "malformed local tag list");
            Vec::new()
        }
    }
}

fn redirect(repository: &str, reference: &str) -> Response {
    let location = format!("/v2/{repository}/manifests/{reference}");
    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::MOVED_PERMANENTLY, [(LOCATION, value)]).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn content_headers(content_type: Option<&str>, digest: &str, size: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = content_type
        && let Ok(value) = HeaderValue::from_str(content_type)
    {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(digest) {
        headers.insert(DOCKER_CONTENT_DIGEST, value.clone());
        headers.insert(ETAG, value);
    }
    headers
}

/// Passes the blob through, failing the body if it delivers more or fewer
/// bytes than advertised.
fn checked_stream(reader: BlobReader) -> impl Stream<Item = Result<Bytes>> + Send {
    let expected = reader.size;
    futures::stream::unfold(
        (reader.stream, 0u64, false),
        move |(mut stream, received, failed)| async move {
            if failed {
                return None;
            }
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let received = received + chunk.len() as u64;
                    if received > expected {
                        let err = DepotError::size_mismatch(expected, received);
                        return Some((Err(err), (stream, received, true)));
                    }
                    Some((Ok(chunk), (stream, received, false)))
                }
                Some(Err(err)) => Some((Err(err), (stream, received, true))),
                None if received != expected => {
                    let err = DepotError::size_mismatch(expected, received);
                    Some((Err(err), (stream, received, true)))
                }
                None => None,
            }
        },
    )
}

/// An OCI error envelope for `err`. `not_found` is the code used when the
/// error means the addressed object does not exist.
fn error_response(err: &DepotError, not_found: ErrorCode) -> Response {
    let code = match err {
        DepotError::NotFound { .. } => not_found,
        DepotError::RateLimit { .. } => ErrorCode::TooManyRequests,
        DepotError::Denied { .. } => ErrorCode::Denied,
        _ => ErrorCode::Unknown,
    };
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = ErrorEnvelope {
        errors: vec![ErrorBody {
            code: code.as_str(),
            message: err.to_string(),
        }],
    };

    let mut response = (status, Json(envelope)).into_response();
    if let DepotError::RateLimit {
        retry_after: Some(seconds),
        ..
    } = err
    {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(*seconds));
    }
    response
}

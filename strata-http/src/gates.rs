//! Cross-cutting request gates.
//!
//! The original decorator stack (require auth, require upload
//! completion, set cache headers) composed per route; here the same
//! gates are middleware applied to the whole image router, with the
//! method/path checks the decorators expressed by placement.

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::{ApiError, AppState};
use strata_store::RepoRef;

/// Cacheable-GET time-to-live (one year).
const CACHE_TTL_SECS: i64 = 31_536_000;
/// Fixed `Last-Modified` value: image artifacts are immutable.
const EPOCH_HTTP_DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Per-request session context distilled from the auth token.
///
/// Authorization policy itself lives in the surrounding stack; this
/// only carries the repository claim the core consumes.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Repository named by the auth token, when one was presented.
    pub repository: Option<RepoRef>,
}

/// Extracts the docker-style token's repository claim into a
/// [`Session`] request extension.
pub async fn session_gate(mut req: Request, next: Next) -> Response {
    let session = Session {
        repository: parse_repository(req.headers()),
    };
    req.extensions_mut().insert(session);
    next.run(req).await
}

/// Parses `Authorization: Token signature=...,repository="ns/name",...`.
fn parse_repository(headers: &HeaderMap) -> Option<RepoRef> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let params = value.strip_prefix("Token ")?;
    params.split(',').find_map(|part| {
        let repo = part.trim().strip_prefix("repository=")?;
        RepoRef::parse(repo.trim_matches('"'))
    })
}

/// Rejects reads of images whose upload has not finished.
///
/// The whole gate is a one-line predicate: the upload mark is absent.
/// Writes pass through, since they are the upload.
pub async fn completion_gate(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::GET {
        match state.registry.images().has_mark(&image_id).await {
            Ok(true) => {
                return ApiError::bad_request("image is being uploaded, retry later")
                    .into_response();
            }
            Ok(false) => {}
            Err(err) => return ApiError::from(err).into_response(),
        }
    }
    next.run(req).await
}

/// Applies the one-year caching policy to public GETs.
///
/// Honors `If-Modified-Since` with an empty 304: stored artifacts
/// never change once visible, so any cached copy is current.
pub async fn cache_headers(req: Request, next: Next) -> Response {
    let cacheable =
        req.method() == Method::GET && !req.uri().path().starts_with("/v1/private_images/");
    if !cacheable {
        return next.run(req).await;
    }

    if req.headers().contains_key(header::IF_MODIFIED_SINCE) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        apply_cache_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    if response.status().is_success() {
        apply_cache_headers(response.headers_mut());
    }
    response
}

fn apply_cache_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000"),
    );
    let expires = (Utc::now() + chrono::Duration::seconds(CACHE_TTL_SECS))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&expires) {
        headers.insert(header::EXPIRES, value);
    }
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_static(EPOCH_HTTP_DATE),
    );
}

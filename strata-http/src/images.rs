//! Image route handlers.

use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;

use crate::error::ApiError;
use crate::gates::Session;
use crate::AppState;
use strata_store::{ObjectStore, StoreKind, image_layer_path};

type ApiResult<T> = Result<T, ApiError>;

const X_DOCKER_SIZE: HeaderName = HeaderName::from_static("x-docker-size");
const X_DOCKER_CHECKSUM: HeaderName = HeaderName::from_static("x-docker-checksum");
const X_ACCEL_REDIRECT: HeaderName = HeaderName::from_static("x-accel-redirect");

/// Public routes 404 when the session's repository is private.
async fn require_public_access(state: &AppState, session: &Session) -> ApiResult<()> {
    if let Some(repo) = &session.repository
        && state.registry.images().store().is_private(repo).await?
    {
        return Err(ApiError::not_found());
    }
    Ok(())
}

/// Private routes serve only sessions naming a private repository.
async fn require_private_access(state: &AppState, session: &Session) -> ApiResult<()> {
    let Some(repo) = &session.repository else {
        // No repository claim: standalone registry or privileged access.
        // Either way private images are disabled.
        return Err(ApiError::not_found());
    };
    if state.registry.images().store().is_private(repo).await? {
        Ok(())
    } else {
        Err(ApiError::not_found())
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn layer_response(state: &AppState, image_id: &str) -> ApiResult<Response> {
    let images = state.registry.images();
    if let Some(prefix) = &state.config.accel_prefix {
        if images.store().kind() == StoreKind::Local {
            let uri = format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                image_layer_path(image_id)
            );
            // Make sure the layer exists before handing off to the
            // accelerator; it answers with the bytes, we answer 404s.
            if !images.has_layer(image_id).await? {
                return Err(ApiError::not_found());
            }
            let value = HeaderValue::from_str(&uri).map_err(|_| {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            })?;
            let mut response = StatusCode::OK.into_response();
            response.headers_mut().insert(X_ACCEL_REDIRECT, value);
            return Ok(response);
        }
        warn!("accelerated downloads configured but storage is not local");
    }

    let reader = images.layer_reader(image_id).await?;
    let body = Body::from_stream(ReaderStream::new(reader));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

async fn json_response(state: &AppState, image_id: &str) -> ApiResult<Response> {
    let images = state.registry.images();
    let data = images.json(image_id).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(size) = images.layer_size(image_id).await
        && let Ok(value) = HeaderValue::from_str(&size.to_string())
    {
        headers.insert(X_DOCKER_SIZE, value);
    }
    if let Ok(Some(checksum)) = images.checksum(image_id).await
        && let Ok(value) = HeaderValue::from_str(&checksum)
    {
        headers.insert(X_DOCKER_CHECKSUM, value);
    }
    Ok((headers, data).into_response())
}

async fn files_response(state: &AppState, image_id: &str) -> ApiResult<Response> {
    let entries = state.registry.images().files(image_id).await?;
    let body = serde_json::to_vec(&entries)
        .map_err(|e| ApiError::from(strata::Error::from(e)))?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

pub(crate) async fn get_image_layer(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_public_access(&state, &session).await?;
    layer_response(&state, &image_id).await
}

pub(crate) async fn put_image_layer(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    body: Body,
) -> ApiResult<Response> {
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);
    state.registry.put_layer(&image_id, reader).await?;
    Ok(StatusCode::OK.into_response())
}

pub(crate) async fn get_image_json(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_public_access(&state, &session).await?;
    json_response(&state, &image_id).await
}

pub(crate) async fn put_image_json(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let checksum = header_str(&headers, "x-docker-checksum");
    state
        .registry
        .put_json(&image_id, &body, checksum, session.repository.as_ref())
        .await?;
    Ok(StatusCode::OK.into_response())
}

pub(crate) async fn put_image_checksum(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let checksum = header_str(&headers, "x-docker-checksum")
        .ok_or_else(|| ApiError::bad_request("missing image's checksum"))?;
    state.registry.put_checksum(&image_id, checksum).await?;
    Ok(StatusCode::OK.into_response())
}

pub(crate) async fn get_image_ancestry(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_public_access(&state, &session).await?;
    let data = state.registry.images().ancestry_bytes(&image_id).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], data).into_response())
}

pub(crate) async fn get_image_files(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_public_access(&state, &session).await?;
    files_response(&state, &image_id).await
}

pub(crate) async fn get_image_diff(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_public_access(&state, &session).await?;
    match state.registry.diff_or_enqueue(&image_id).await? {
        Some(diff_json) => Ok((
            [(header::CONTENT_TYPE, "application/json")],
            diff_json,
        )
            .into_response()),
        // Cache miss: a worker owns the computation now, clients poll.
        None => Ok(StatusCode::OK.into_response()),
    }
}

pub(crate) async fn get_private_image_layer(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_private_access(&state, &session).await?;
    layer_response(&state, &image_id).await
}

pub(crate) async fn get_private_image_json(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_private_access(&state, &session).await?;
    json_response(&state, &image_id).await
}

pub(crate) async fn get_private_image_files(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(image_id): Path<String>,
) -> ApiResult<Response> {
    require_private_access(&state, &session).await?;
    files_response(&state, &image_id).await
}

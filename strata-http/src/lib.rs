//! HTTP surface for the strata image-layer registry.
//!
//! Exposes the docker v1-style image routes over a [`Registry`]:
//!
//! ```text
//! PUT  /v1/images/{id}/json       create / retry image metadata
//! PUT  /v1/images/{id}/layer      upload layer bytes
//! PUT  /v1/images/{id}/checksum   finalize with client checksum
//! GET  /v1/images/{id}/layer      layer bytes (or X-Accel-Redirect)
//! GET  /v1/images/{id}/json       metadata + size/checksum headers
//! GET  /v1/images/{id}/ancestry   ancestry list
//! GET  /v1/images/{id}/files      files inventory
//! GET  /v1/images/{id}/diff       diff result (empty body on miss)
//! GET  /v1/private_images/{id}/{layer,json,files}
//! ```
//!
//! Cross-cutting request gates (session extraction, the
//! upload-completion check, cache headers) are middleware in
//! [`gates`]; route handlers live in [`images`].

#![allow(clippy::missing_docs_in_private_items)]

mod error;
mod gates;
mod images;

use axum::Router;
use axum::middleware;
use axum::routing::{get, put};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use gates::Session;
use strata::Registry;

/// Deployment knobs for the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Accelerated-download URI prefix (e.g. an nginx internal
    /// location). When set and the store is local, `GET layer` answers
    /// with an `X-Accel-Redirect` header instead of streaming.
    pub accel_prefix: Option<String>,
}

/// Shared state behind every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    registry: Registry,
    config: ServiceConfig,
}

impl AppState {
    /// Returns the registry service.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

/// Builds the service router.
pub fn app(registry: Registry, config: ServiceConfig) -> Router {
    let state = AppState { registry, config };
    Router::new()
        .route(
            "/v1/images/:image_id/layer",
            get(images::get_image_layer).put(images::put_image_layer),
        )
        .route(
            "/v1/images/:image_id/json",
            get(images::get_image_json).put(images::put_image_json),
        )
        .route(
            "/v1/images/:image_id/checksum",
            put(images::put_image_checksum),
        )
        .route(
            "/v1/images/:image_id/ancestry",
            get(images::get_image_ancestry),
        )
        .route("/v1/images/:image_id/files", get(images::get_image_files))
        .route("/v1/images/:image_id/diff", get(images::get_image_diff))
        .route(
            "/v1/private_images/:image_id/layer",
            get(images::get_private_image_layer),
        )
        .route(
            "/v1/private_images/:image_id/json",
            get(images::get_private_image_json),
        )
        .route(
            "/v1/private_images/:image_id/files",
            get(images::get_private_image_files),
        )
        .route_layer(middleware::from_fn(gates::cache_headers))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            gates::completion_gate,
        ))
        .route_layer(middleware::from_fn(gates::session_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//! Defines routes for the ingestion API.
//!
//! ## Structure
//! - `GET  /healthz`, `GET /readyz` — probes
//! - `POST /api/v1/uploads` — multipart upload (`file` part + metadata fields)
//! - `POST /api/v1/uploads/stream?filename=` — raw body upload, `Content-Length` required
//! - `GET|HEAD /api/v1/objects/{*key}` — read a stored object back
//!
//! The wildcard `*key` allows date-partitioned keys like `2026/10/19/clip.mp4`.
//!
//! Every request gets an `x-request-id` (kept when the client sends one,
//! echoed on the response), a tracing span carrying it, and panics in a
//! handler become a 500 instead of a dropped connection.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{get_object, head_object},
        upload_handlers::{upload_multipart, upload_stream},
    },
    state::AppState,
};
use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::Request,
    routing::{get, post},
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the router. Body size is enforced by the upload handlers against
/// `AppState::max_upload_bytes`, so axum's default body limit is lifted.
pub fn routes() -> Router<AppState> {
    with_middleware(api())
}

fn api() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/uploads", post(upload_multipart))
        .route("/api/v1/uploads/stream", post(upload_stream))
        .route(
            "/api/v1/objects/{*key}",
            get(get_object).head(head_object),
        )
        .layer(DefaultBodyLimit::disable())
}

/// Outermost last: the request id is assigned before the trace span opens,
/// and the catch-panic layer sits closest to the handlers.
fn with_middleware(router: Router<AppState>) -> Router<AppState> {
    router
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!(
                "http",
                method = %request.method(),
                uri = %request.uri(),
                request_id,
            )
        }))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

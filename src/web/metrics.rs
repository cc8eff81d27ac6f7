//! Prometheus metrics endpoint

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::{POSTS_TOTAL, REGISTRY};

/// GET /metrics
///
/// Refreshes the post gauge, then returns every registered metric in the
/// Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.db.count_posts().await {
        Ok(count) => POSTS_TOTAL.set(count),
        Err(error) => tracing::warn!(%error, "Failed to refresh post count"),
    }

    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(text) => (StatusCode::OK, [(CONTENT_TYPE, encoder.format_type())], text).into_response(),
        Err(error) => {
            tracing::error!(%error, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}

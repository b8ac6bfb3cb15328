//! Prometheus-style text exposition.

use axum::{extract::State, http::header, response::IntoResponse};

use crate::state::AppState;

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

//! Operational HTTP endpoints served by both roles.
//!
//! Neither endpoint is authenticated; bind them to loopback or a management
//! network.

pub mod health;
pub mod metrics;

use axum::{routing::get, Router};

use crate::state::AppState;

/// `/health` and `/metrics`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .with_state(state)
}

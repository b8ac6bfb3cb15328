//! Supervisor health probe.

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::config::Role;
use crate::state::{AppState, TunnelStats};

/// `GET /health`: 200 while this process is ACTIVE, 503 otherwise.
///
/// Bridge: ACTIVE while the tunnel listener is accepting (`draining` during
/// shutdown). Connector: ACTIVE while its session is (`disconnected`
/// otherwise).
pub async fn health(State(state): State<AppState>) -> Response {
    let active = state.is_active().await;
    let (status_code, status) = match (active, state.role) {
        (true, _) => (StatusCode::OK, "ok"),
        (false, Role::Bridge) => (StatusCode::SERVICE_UNAVAILABLE, "draining"),
        (false, Role::Connector) => (StatusCode::SERVICE_UNAVAILABLE, "disconnected"),
    };

    let (active_sessions, sessions) = match &state.registry {
        Some(registry) => {
            let snapshot = registry.snapshot().await;
            let count = snapshot.iter().filter(|s| s.state == "active").count();
            (count, json!(snapshot))
        }
        None => (usize::from(active), Value::Null),
    };

    let customer_id = match state.role {
        Role::Connector => json!(state.config.connector.customer_id),
        Role::Bridge => Value::Null,
    };

    let body = json!({
        "status": status,
        "customer_id": customer_id,
        "active_sessions": active_sessions,
        "role": state.role.as_str(),
        "mode": state.config.mode.as_str(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "tunnel": tunnel_section(&state.tunnel_stats).await,
    });
    (status_code, Json(body)).into_response()
}

async fn tunnel_section(ts: &TunnelStats) -> Value {
    let (rtt_median, rtt_p95) = ts.rtt_stats().await.unwrap_or((0, 0));

    let events = ts.events.lock().await;
    let now = Instant::now();
    let recent_events: Vec<Value> = events
        .iter()
        .rev()
        .take(10)
        .map(|e| {
            let ago = now.duration_since(e.timestamp);
            let ago_str = if ago.as_secs() < 60 {
                format!("{}s ago", ago.as_secs())
            } else if ago.as_secs() < 3600 {
                format!("{}m ago", ago.as_secs() / 60)
            } else {
                format!("{}h ago", ago.as_secs() / 3600)
            };
            json!({
                "time": ago_str,
                "event": e.event_type.as_str(),
                "detail": e.detail,
            })
        })
        .collect();

    json!({
        "connected": ts.connected.load(Ordering::Relaxed),
        "reconnects": ts.reconnects.load(Ordering::Relaxed),
        "rtt_median_ms": rtt_median,
        "rtt_p95_ms": rtt_p95,
        "recent_events": recent_events,
    })
}

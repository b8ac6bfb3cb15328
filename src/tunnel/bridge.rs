//! Bridge side: accepts connector tunnels and proxies customer traffic into them.
//!
//! Two listeners:
//! 1. The tunnel listener (`bridge.tunnel_listen`) where connectors dial in,
//!    handshake, and get registered by identity.
//! 2. The HTTP front (`bridge.http_listen`), behind the reverse proxy, which
//!    serves `/t/{customer}/{rest}` by opening a stream on the customer's
//!    session and speaking HTTP/1.1 over it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path as AxumPath, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use super::frame::FrameCodec;
use super::handshake::{self, LocalParams};
use super::mux::Side;
use super::registry::SessionRegistry;
use super::routing::{Decision, RoutingPolicy};
use super::session::{Session, SessionParams};
use crate::auth::{self, SecretProvider};
use crate::config::ConfigError;
use crate::error::TunnelError;
use crate::metrics::TunnelMetrics;
use crate::state::AppState;

/// Seconds a client is told to wait when the customer has no tunnel.
const RETRY_AFTER_SECS: &str = "5";

/// State shared by the tunnel listener and the proxy handlers.
#[derive(Clone)]
pub struct BridgeState {
    pub registry: SessionRegistry,
    pub policy: RoutingPolicy,
    pub metrics: Arc<TunnelMetrics>,
    pub secrets: Arc<dyn SecretProvider>,
    pub local_params: LocalParams,
    pub session_params: SessionParams,
    pub handshake_timeout: Duration,
    pub timestamp_skew: Duration,
    /// Bound on one forwarded request up to its response head.
    pub proxy_timeout: Duration,
    /// Relay target for connector-opened streams.
    pub cloud_upstream: Option<String>,
}

impl BridgeState {
    /// Build from the bridge's [`AppState`]; fails if the secret table does not decode.
    pub fn from_app(app: &AppState) -> Result<Self, ConfigError> {
        let config = &app.config;
        let registry = app
            .registry
            .clone()
            .unwrap_or_else(|| SessionRegistry::new(app.metrics.clone()));
        Ok(Self {
            registry,
            policy: RoutingPolicy::new(config.mode),
            metrics: app.metrics.clone(),
            secrets: Arc::new(config.secrets()?),
            local_params: config.protocol.local_params(),
            session_params: config.protocol.session_params(None),
            handshake_timeout: config.protocol.handshake_timeout(),
            timestamp_skew: config.protocol.timestamp_skew(),
            proxy_timeout: Duration::from_secs(config.bridge.proxy_timeout_secs),
            cloud_upstream: config.bridge.cloud_upstream.clone(),
        })
    }
}

// ─── Tunnel listener ─────────────────────────────────────────────────────────

/// Accept connector connections until `cancel` fires.
pub async fn run_tunnel_listener(
    listener: TcpListener,
    state: BridgeState,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(
                    handle_connection(stream, peer, state)
                        .instrument(info_span!("tunnel_conn", peer = %peer)),
                );
            }
            Err(e) => {
                warn!(error = %e, "Tunnel accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    info!("Tunnel listener stopped");
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: BridgeState) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, FrameCodec::new());

    let accepted = match handshake::accept(
        &mut framed,
        state.secrets.as_ref(),
        state.local_params,
        state.timestamp_skew,
        state.handshake_timeout,
    )
    .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            state.metrics.handshake_failed();
            warn!(peer = %peer, error = %e, "Tunnel handshake failed");
            return;
        }
    };

    let (session, mut incoming) = Session::spawn(
        framed,
        Side::Bridge,
        accepted.negotiated,
        accepted.identity,
        state.session_params.clone(),
        state.metrics.clone(),
    );
    info!(
        session_id = %session.id(),
        customer = %accepted.customer_hash,
        "Tunnel established"
    );
    state.registry.install(session.clone()).await;

    // Ends when the session's reader stops.
    while let Some(stream) = incoming.accept().await {
        match &state.cloud_upstream {
            Some(upstream) => {
                let upstream = upstream.clone();
                let stream_id = stream.id();
                tokio::spawn(
                    async move {
                        if let Err(e) = super::relay_to_tcp(stream, &upstream).await {
                            debug!(error = %e, "Connector stream relay ended with error");
                        }
                    }
                    .instrument(info_span!("connector_stream", stream_id)),
                );
            }
            None => stream.refuse(),
        }
    }

    let reason = session.closed().await;
    state.registry.remove_if_current(&session).await;
    info!(session_id = %session.id(), reason = %reason, "Tunnel closed");
}

// ─── HTTP front ──────────────────────────────────────────────────────────────

/// `/t/{customer}` and `/t/{customer}/{*rest}`, any method.
pub fn bridge_router(state: BridgeState) -> Router {
    Router::new()
        .route("/t/{customer}", any(proxy_root))
        .route("/t/{customer}/", any(proxy_root))
        .route("/t/{customer}/{*rest}", any(proxy_path))
        .with_state(state)
}

async fn proxy_root(
    State(state): State<BridgeState>,
    AxumPath(customer): AxumPath<String>,
    req: Request,
) -> Response {
    route_request(state, customer, String::new(), req).await
}

async fn proxy_path(
    State(state): State<BridgeState>,
    AxumPath((customer, rest)): AxumPath<(String, String)>,
    req: Request,
) -> Response {
    route_request(state, customer, rest, req).await
}

/// The bridge's full HTTP front: `/health`, `/metrics` and the proxy routes,
/// with request tracing and a cap on concurrent requests.
pub fn front_router(app: AppState, bridge: BridgeState) -> Router {
    let max_requests = app.config.bridge.max_http_requests.max(1);
    crate::routes::router(app)
        .merge(bridge_router(bridge))
        .layer(ConcurrencyLimitLayer::new(max_requests))
        .layer(TraceLayer::new_for_http())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && websocket
}

async fn route_request(state: BridgeState, customer: String, rest: String, req: Request) -> Response {
    if !auth::is_valid_identity(&customer) {
        return error_response(StatusCode::BAD_REQUEST, "BAD_CUSTOMER", "Invalid customer");
    }
    let is_upgrade = is_websocket_upgrade(req.headers());

    match state.policy.decide(req.method(), &rest, is_upgrade) {
        Decision::Forward => {}
        Decision::LocalStatus => return tunnel_status(&state, &customer).await,
        Decision::Reject(status, message) => {
            return error_response(status, "NOT_IMPLEMENTED", message)
        }
    }

    let session = match state.registry.get_active(&customer).await {
        Ok(session) => session,
        Err(e) => {
            state.metrics.no_active_tunnel();
            return no_active_tunnel(&e);
        }
    };

    let forwarded = tokio::time::timeout(
        state.proxy_timeout,
        forward(&session, &customer, &rest, req, is_upgrade),
    )
    .await;
    match forwarded {
        Ok(Ok(response)) => response,
        Ok(Err(ForwardError::Unavailable(e))) => no_active_tunnel(&e),
        Ok(Err(ForwardError::Upstream(message))) => {
            warn!(customer = %session.customer_hash(), error = %message, "Forward failed");
            error_response(StatusCode::BAD_GATEWAY, "TUNNEL_STREAM_FAILED", &message)
        }
        Err(_) => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "TIMEOUT",
            "Upstream did not respond in time",
        ),
    }
}

fn no_active_tunnel(err: &TunnelError) -> Response {
    let mut response = error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "NO_ACTIVE_TUNNEL",
        &err.to_string(),
    );
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    response
}

async fn tunnel_status(state: &BridgeState, customer: &str) -> Response {
    let summary = state.registry.summary(customer).await;
    Json(json!({
        "customer_hash": auth::customer_hash(customer),
        "mode": state.policy.mode().as_str(),
        "connected": summary.as_ref().is_some_and(|s| s.state == "active"),
        "session": summary,
    }))
    .into_response()
}

enum ForwardError {
    /// Session could not take a new stream (draining, superseded, at limit).
    Unavailable(TunnelError),
    /// Stream or HTTP exchange failed mid-flight.
    Upstream(String),
}

impl From<hyper::Error> for ForwardError {
    fn from(e: hyper::Error) -> Self {
        Self::Upstream(e.to_string())
    }
}

/// Relay one HTTP request over a fresh stream and return the upstream's response.
async fn forward(
    session: &Session,
    customer: &str,
    rest: &str,
    mut req: Request,
    is_upgrade: bool,
) -> Result<Response, ForwardError> {
    let stream = session.open_stream().map_err(ForwardError::Unavailable)?;
    let stream_id = stream.id();
    debug!(stream_id, method = %req.method(), "Forwarding request");

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(
        async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "Tunnel HTTP connection ended with error");
            }
        }
        .instrument(info_span!("tunnel_http", stream_id)),
    );

    let target = match req.uri().query() {
        Some(q) => format!("/{rest}?{q}"),
        None => format!("/{rest}"),
    };
    *req.uri_mut() = target
        .parse::<Uri>()
        .map_err(|e| ForwardError::Upstream(format!("bad target {target}: {e}")))?;
    let prefix = HeaderValue::from_str(&format!("/t/{customer}"))
        .map_err(|e| ForwardError::Upstream(e.to_string()))?;
    req.headers_mut().insert("x-forwarded-prefix", prefix);

    let client_upgrade = is_upgrade.then(|| hyper::upgrade::on(&mut req));
    let mut response = sender.send_request(req).await?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(
                async move {
                    match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok((client, upstream)) => {
                            let mut client = TokioIo::new(client);
                            let mut upstream = TokioIo::new(upstream);
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut client, &mut upstream).await
                            {
                                debug!(error = %e, "WebSocket relay ended with error");
                            }
                        }
                        Err(e) => debug!(error = %e, "WebSocket upgrade failed"),
                    }
                }
                .instrument(info_span!("tunnel_ws", stream_id)),
            );
        }
    }

    Ok(response.map(Body::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn detects_websocket_upgrades() {
        assert!(is_websocket_upgrade(&headers(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(!is_websocket_upgrade(&headers(&[("upgrade", "websocket")])));
        assert!(!is_websocket_upgrade(&headers(&[
            ("connection", "upgrade"),
            ("upgrade", "h2c"),
        ])));
    }

    #[test]
    fn no_active_tunnel_carries_retry_after() {
        let resp = no_active_tunnel(&TunnelError::NoActiveTunnel("acme".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "5");
    }
}

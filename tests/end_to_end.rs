//! Bridge and connector over loopback TCP, driven through the bridge's HTTP
//! front with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, Uri};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use rtun::config::{Config, CustomerConfig};
use rtun::state::TunnelEventType;
use rtun::tunnel::{bridge, connector, Mode};
use rtun::{AppState, BridgeState, Role};

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Stand-in for the on-prem service.
async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/echo", post(|body: axum::body::Bytes| async move { body }))
        .route(
            "/whoami",
            get(|uri: Uri, headers: HeaderMap| async move {
                let prefix = headers
                    .get("x-forwarded-prefix")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                format!("{prefix} {uri}")
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

struct Bridge {
    app: AppState,
    state: BridgeState,
    router: Router,
    tunnel_addr: String,
}

async fn spawn_bridge(mode: Mode, cancel: &CancellationToken) -> Bridge {
    let config = Config {
        mode,
        customers: vec![CustomerConfig {
            identity: "acme".into(),
            secret_b64: b64(&[7u8; 32]),
        }],
        ..Config::default()
    };
    let app = AppState::new(Arc::new(config), Role::Bridge);
    let state = BridgeState::from_app(&app).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(bridge::run_tunnel_listener(
        listener,
        state.clone(),
        cancel.clone(),
    ));
    app.accepting
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let router = bridge::front_router(app.clone(), state.clone());
    Bridge {
        app,
        state,
        router,
        tunnel_addr,
    }
}

fn spawn_connector(
    tunnel_addr: &str,
    upstream: &str,
    secret: &[u8],
    cancel: &CancellationToken,
) -> AppState {
    let mut config = Config::default();
    config.connector.bridge_addr = tunnel_addr.to_string();
    config.connector.identity = "acme".into();
    config.connector.secret_b64 = b64(secret);
    config.connector.customer_id = "cust-acme".into();
    config.connector.upstream = upstream.to_string();
    config.reconnect.base_delay_ms = 50;
    let app = AppState::new(Arc::new(config), Role::Connector);
    tokio::spawn(connector::run(app.clone(), cancel.clone()));
    app
}

async fn wait_for_tunnel(bridge: &Bridge) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while bridge.state.registry.get_active("acme").await.is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connector never registered");
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn get_req(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn requests_reach_upstream_through_tunnel() {
    let cancel = CancellationToken::new();
    let upstream = spawn_upstream().await;
    let bridge = spawn_bridge(Mode::ReverseTunnel, &cancel).await;
    let _connector = spawn_connector(&bridge.tunnel_addr, &upstream, &[7u8; 32], &cancel);
    wait_for_tunnel(&bridge).await;

    let (status, _, body) = send(&bridge.router, get_req("/t/acme/ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"pong");

    let (status, _, body) = send(&bridge.router, get_req("/t/acme/whoami?x=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "/t/acme /whoami?x=1");

    // Larger than the default window, so credit has to flow back.
    let payload: Vec<u8> = (0..600_000u32).map(|i| (i % 251) as u8).collect();
    let req = Request::post("/t/acme/echo")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _, body) = send(&bridge.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, payload);

    let metrics = bridge.app.metrics.render();
    assert!(metrics.contains("tunnel_sessions_active{role=\"bridge\"} 1"));
    assert!(bridge.app.metrics.bytes_in() >= payload.len() as u64);

    cancel.cancel();
}

#[tokio::test]
async fn status_and_health_report_the_session() {
    let cancel = CancellationToken::new();
    let upstream = spawn_upstream().await;
    let bridge = spawn_bridge(Mode::ContainerBridge, &cancel).await;
    let connector = spawn_connector(&bridge.tunnel_addr, &upstream, &[7u8; 32], &cancel);
    wait_for_tunnel(&bridge).await;

    let (status, _, body) = send(&bridge.router, get_req("/t/acme/_tunnel/status")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["connected"], true);
    assert_eq!(json["mode"], "container_bridge");
    assert_eq!(json["session"]["state"], "active");

    let (status, _, body) = send(&bridge.router, get_req("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["active_sessions"], 1);

    // Connector health flips once its own session is up.
    let connector_router = rtun::routes::router(connector.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, _, body) = send(&connector_router, get_req("/health")).await;
            if status == StatusCode::OK {
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(json["customer_id"], "cust-acme");
                assert_eq!(json["active_sessions"], 1);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connector never reported healthy");

    cancel.cancel();
}

#[tokio::test]
async fn api_proxy_without_session_fails_fast() {
    let cancel = CancellationToken::new();
    let bridge = spawn_bridge(Mode::ApiProxy, &cancel).await;

    let started = std::time::Instant::now();
    let (status, headers, _) = send(&bridge.router, get_req("/t/acme/ping")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get("retry-after").unwrap(), "5");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(bridge
        .app
        .metrics
        .render()
        .contains("tunnel_no_active_tunnel_total{role=\"bridge\"} 1"));

    let (status, _, _) = send(&bridge.router, get_req("/t/bad%20name/ping")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    cancel.cancel();
}

#[tokio::test]
async fn api_proxy_rejects_websocket_upgrades_locally() {
    let cancel = CancellationToken::new();
    let upstream = spawn_upstream().await;
    let bridge = spawn_bridge(Mode::ApiProxy, &cancel).await;
    let _connector = spawn_connector(&bridge.tunnel_addr, &upstream, &[7u8; 32], &cancel);
    wait_for_tunnel(&bridge).await;

    let req = Request::get("/t/acme/ws")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&bridge.router, req).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

    cancel.cancel();
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let cancel = CancellationToken::new();
    let upstream = spawn_upstream().await;
    let bridge = spawn_bridge(Mode::ReverseTunnel, &cancel).await;
    let connector = spawn_connector(&bridge.tunnel_addr, &upstream, &[8u8; 32], &cancel);

    tokio::time::timeout(Duration::from_secs(5), async {
        while bridge.app.metrics.handshake_failures() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("handshake failure never counted");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let rejected = connector
                .tunnel_stats
                .events
                .lock()
                .await
                .iter()
                .any(|e| e.event_type == TunnelEventType::HandshakeRejected);
            if rejected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connector never saw the rejection");
    assert!(connector.metrics.handshake_failures() >= 1);
    assert!(connector
        .metrics
        .render()
        .contains("tunnel_handshake_failures_total{role=\"connector\"}"));

    assert!(bridge.state.registry.is_empty().await);
    let (status, _, _) = send(&bridge.router, get_req("/t/acme/ping")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    cancel.cancel();
}

#[tokio::test]
async fn connector_redials_after_session_loss() {
    let cancel = CancellationToken::new();
    let upstream = spawn_upstream().await;
    let bridge = spawn_bridge(Mode::ReverseTunnel, &cancel).await;
    let connector = spawn_connector(&bridge.tunnel_addr, &upstream, &[7u8; 32], &cancel);
    wait_for_tunnel(&bridge).await;

    let first = bridge.state.registry.get_active("acme").await.unwrap();
    first.terminate(rtun::TunnelError::KeepaliveTimeout);
    assert_eq!(first.closed().await, rtun::TunnelError::KeepaliveTimeout);

    let second = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(session) = bridge.state.registry.get_active("acme").await {
                if session.id() != first.id() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connector never redialed");
    assert!(second.is_active());
    assert!(connector.metrics.reconnects() >= 1);
    assert!(
        connector
            .tunnel_stats
            .reconnects
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );

    let (status, _, body) = send(&bridge.router, get_req("/t/acme/ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"pong");

    cancel.cancel();
}

#[tokio::test]
async fn vpn_gateway_never_touches_sessions() {
    let cancel = CancellationToken::new();
    let bridge = spawn_bridge(Mode::VpnGateway, &cancel).await;
    let (status, _, _) = send(&bridge.router, get_req("/t/acme/anything")).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(!bridge
        .app
        .metrics
        .render()
        .contains("tunnel_no_active_tunnel_total{role=\"bridge\"} 1"));
    cancel.cancel();
}

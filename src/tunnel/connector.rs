//! Connector side: dials the bridge, keeps one session alive, and relays
//! bridge-opened streams to the on-prem upstream.
//!
//! The outer loop connects, handshakes, serves until the session ends, then
//! sleeps a jittered backoff and tries again. A bridge that closes with
//! `GOING_AWAY` (shutdown or restart) is retried without waiting out the
//! backoff ladder.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::frame::FrameCodec;
use super::handshake;
use super::mux::Side;
use super::session::{Incoming, Session};
use crate::auth::Secret;
use crate::config::{ConfigError, ConnectorConfig};
use crate::error::TunnelError;
use crate::state::{AppState, TunnelEventType};

/// How long in-flight streams get to finish when the connector shuts down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Transport a session can run over: plain TCP or TLS-wrapped TCP.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// Open the transport to the bridge, wrapping it in TLS when configured.
pub async fn dial(config: &ConnectorConfig) -> io::Result<Box<dyn TunnelIo>> {
    let timeout = Duration::from_secs(config.dial_timeout_secs);
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(&config.bridge_addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
    tcp.set_nodelay(true)?;

    if !config.tls {
        return Ok(Box::new(tcp));
    }

    let domain = match &config.tls_domain {
        Some(domain) => domain.clone(),
        None => host_part(&config.bridge_addr).to_string(),
    };
    let connector = tokio_native_tls::native_tls::TlsConnector::new()
        .map_err(io::Error::other)?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let tls = tokio::time::timeout(timeout, connector.connect(&domain, tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
        .map_err(io::Error::other)?;
    Ok(Box::new(tls))
}

/// `host` from `host:port` or `[v6]:port`.
fn host_part(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

/// Dial, authenticate and start a session.
async fn establish(
    state: &AppState,
    secret: &Secret,
) -> Result<(Session, Incoming), TunnelError> {
    let config = &state.config;
    let io = dial(&config.connector).await?;
    let mut framed = Framed::new(io, FrameCodec::new());
    let negotiated = handshake::connect(
        &mut framed,
        &config.connector.identity,
        secret,
        config.protocol.local_params(),
        config.protocol.handshake_timeout(),
    )
    .await?;
    Ok(Session::spawn(
        framed,
        Side::Connector,
        negotiated,
        config.connector.identity.clone(),
        config
            .protocol
            .session_params(Some(state.tunnel_stats.clone())),
        state.metrics.clone(),
    ))
}

/// Relay every bridge-opened stream to `upstream` until the session ends.
async fn serve_incoming(mut incoming: Incoming, upstream: String) {
    while let Some(stream) = incoming.accept().await {
        let upstream = upstream.clone();
        let stream_id = stream.id();
        tokio::spawn(
            async move {
                if let Err(e) = super::relay_to_tcp(stream, &upstream).await {
                    debug!(error = %e, "Upstream relay ended with error");
                }
            }
            .instrument(info_span!("bridge_stream", stream_id)),
        );
    }
}

/// Carry each connection accepted on `listener` to the bridge as a new stream
/// on whichever session is current.
async fn serve_local(
    listener: TcpListener,
    current: Arc<RwLock<Option<Session>>>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (mut socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Local accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let session = current.read().await.clone();
        let Some(session) = session else {
            debug!(peer = %peer, "No tunnel for local connection, dropping");
            continue;
        };
        let mut stream = match session.open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Could not open stream for local connection");
                continue;
            }
        };
        tokio::spawn(
            async move {
                let _ = socket.set_nodelay(true);
                if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                    debug!(error = %e, "Local relay ended with error");
                }
            }
            .instrument(info_span!("local_conn", peer = %peer)),
        );
    }
}

/// Event logged for the reason a session (or attempt) ended.
fn event_for(reason: &TunnelError) -> TunnelEventType {
    match reason {
        TunnelError::AuthFailed(_) => TunnelEventType::HandshakeRejected,
        TunnelError::KeepaliveTimeout => TunnelEventType::KeepaliveTimeout,
        TunnelError::SessionSuperseded => TunnelEventType::Superseded,
        _ => TunnelEventType::Disconnected,
    }
}

/// Keep a session to the bridge until `cancel` fires.
pub async fn run(state: AppState, cancel: CancellationToken) -> Result<(), ConfigError> {
    let secret = state.config.connector_secret()?;
    let upstream = state.config.connector.upstream.clone();
    let mut backoff = state.config.reconnect.backoff();

    if let Some(addr) = &state.config.connector.local_listen {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ConfigError::Invalid(format!("cannot bind connector.local_listen {addr}: {e}"))
        })?;
        info!("Local listener on {addr}");
        tokio::spawn(serve_local(
            listener,
            state.current_session.clone(),
            cancel.clone(),
        ));
    }

    loop {
        info!(bridge = %state.config.connector.bridge_addr, "Connecting to bridge");
        let attempt = tokio::select! {
            () = cancel.cancelled() => break,
            attempt = establish(&state, &secret) => attempt,
        };

        let reason = match attempt {
            Ok((session, incoming)) => {
                info!(session_id = %session.id(), "Tunnel established");
                *state.current_session.write().await = Some(session.clone());
                state.tunnel_stats.connected.store(true, Ordering::Relaxed);
                state
                    .tunnel_stats
                    .push_event(TunnelEventType::Connected, session.id().to_string())
                    .await;
                tokio::spawn(serve_incoming(incoming, upstream.clone()));

                let started = Instant::now();
                let reason = tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Draining tunnel for shutdown");
                        session.drain(SHUTDOWN_GRACE).await;
                        *state.current_session.write().await = None;
                        state.tunnel_stats.connected.store(false, Ordering::Relaxed);
                        break;
                    }
                    reason = session.closed() => reason,
                };
                state.tunnel_stats.connected.store(false, Ordering::Relaxed);
                *state.current_session.write().await = None;
                backoff.record_session(started.elapsed());
                warn!(session_id = %session.id(), reason = %reason, "Tunnel closed");
                reason
            }
            Err(e) => {
                if e.is_auth_failure() {
                    state.metrics.handshake_failed();
                    warn!(error = %e, "Bridge rejected handshake");
                } else {
                    warn!(error = %e, "Connect failed");
                }
                e
            }
        };

        state
            .tunnel_stats
            .push_event(event_for(&reason), reason.to_string())
            .await;

        if reason == TunnelError::GoingAway {
            backoff.reset();
        }
        let delay = backoff.next_delay(&mut rand::thread_rng());
        state.metrics.reconnect_scheduled();
        state.tunnel_stats.reconnects.fetch_add(1, Ordering::Relaxed);
        state
            .tunnel_stats
            .push_event(
                TunnelEventType::ReconnectAttempt,
                format!("in {}ms", delay.as_millis()),
            )
            .await;
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = backoff.attempt(),
            "Reconnecting"
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    info!("Connector stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_part_strips_port() {
        assert_eq!(host_part("bridge.example.com:8443"), "bridge.example.com");
        assert_eq!(host_part("[::1]:8443"), "::1");
        assert_eq!(host_part("localhost"), "localhost");
    }

    #[test]
    fn end_reasons_map_to_events() {
        assert_eq!(
            event_for(&TunnelError::AuthFailed(String::new())),
            TunnelEventType::HandshakeRejected
        );
        assert_eq!(
            event_for(&TunnelError::KeepaliveTimeout),
            TunnelEventType::KeepaliveTimeout
        );
        assert_eq!(
            event_for(&TunnelError::SessionSuperseded),
            TunnelEventType::Superseded
        );
        assert_eq!(
            event_for(&TunnelError::TransportClosed),
            TunnelEventType::Disconnected
        );
    }
}

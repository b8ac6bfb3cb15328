//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};

use crate::config::{Config, Role};
use crate::metrics::TunnelMetrics;
use crate::tunnel::registry::SessionRegistry;
use crate::tunnel::session::Session;

/// Shared state for either end of the tunnel.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    pub role: Role,
    /// Monotonic instant when the process started (for uptime calculation).
    pub start_time: Instant,
    pub metrics: Arc<TunnelMetrics>,
    /// Connection history and RTT samples.
    pub tunnel_stats: Arc<TunnelStats>,
    /// Bridge only: identity → session.
    pub registry: Option<SessionRegistry>,
    /// Connector only: the session currently carrying traffic.
    pub current_session: Arc<RwLock<Option<Session>>>,
    /// Bridge only: cleared when shutdown begins so `/health` reports draining.
    pub accepting: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: Arc<Config>, role: Role) -> Self {
        let metrics = Arc::new(TunnelMetrics::new(role.as_str()));
        let registry = (role == Role::Bridge).then(|| SessionRegistry::new(metrics.clone()));
        Self {
            config,
            role,
            start_time: Instant::now(),
            metrics,
            tunnel_stats: Arc::new(TunnelStats::new()),
            registry,
            current_session: Arc::new(RwLock::new(None)),
            accepting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this process should report healthy.
    pub async fn is_active(&self) -> bool {
        match self.role {
            Role::Bridge => self.accepting.load(Ordering::Relaxed),
            Role::Connector => self
                .current_session
                .read()
                .await
                .as_ref()
                .is_some_and(Session::is_active),
        }
    }
}

/// Maximum number of recent events to retain.
const MAX_TUNNEL_EVENTS: usize = 50;

/// Maximum number of pong RTT samples to keep for quality tracking.
const MAX_RTT_SAMPLES: usize = 20;

/// Tunnel connection event types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Connected,
    Disconnected,
    HandshakeRejected,
    KeepaliveTimeout,
    Superseded,
    ReconnectAttempt,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::HandshakeRejected => "handshake_rejected",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::Superseded => "superseded",
            Self::ReconnectAttempt => "reconnect_attempt",
        }
    }
}

/// A tunnel lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub timestamp: Instant,
    pub event_type: TunnelEventType,
    pub detail: String,
}

/// Connector-side connection statistics: atomics for the hot path, a Mutex
/// only for the event log and RTT samples.
pub struct TunnelStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub events: Mutex<VecDeque<ConnectionEvent>>,
    /// Rolling window of pong RTT samples (ms).
    pub rtt_samples: Mutex<VecDeque<u64>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_TUNNEL_EVENTS)),
            rtt_samples: Mutex::new(VecDeque::with_capacity(MAX_RTT_SAMPLES)),
        }
    }

    /// Push a connection event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: TunnelEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_TUNNEL_EVENTS {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }

    /// Record a pong RTT sample.
    pub async fn record_rtt(&self, rtt_ms: u64) {
        let mut samples = self.rtt_samples.lock().await;
        if samples.len() >= MAX_RTT_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(rtt_ms);
    }

    /// Median and p95 RTT from the samples, or `None` if there are none.
    pub async fn rtt_stats(&self) -> Option<(u64, u64)> {
        let samples = self.rtt_samples.lock().await;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let p95_idx = (sorted.len() as f64 * 0.95).ceil() as usize;
        let p95 = sorted[p95_idx.min(sorted.len() - 1)];
        Some((median, p95))
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

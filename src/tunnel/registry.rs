//! Customer identity → live session map on the bridge.
//!
//! At most one session per identity is routable. A new handshake for an
//! identity that already has a session supersedes the old one: the old session
//! is terminated with `SESSION_SUPERSEDED` under the same write lock that
//! installs the new one, so concurrent lookups never see both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::mux::SessionState;
use super::session::Session;
use crate::error::TunnelError;
use crate::metrics::TunnelMetrics;

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    metrics: Arc<TunnelMetrics>,
}

/// Point-in-time view of one registered session, safe to expose.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub customer_hash: String,
    pub state: &'static str,
    pub open_streams: usize,
    pub connected_secs: u64,
    pub idle_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
}

impl SessionSummary {
    fn of(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            customer_hash: session.customer_hash().to_string(),
            state: session.state().as_str(),
            open_streams: session.open_streams(),
            connected_secs: SystemTime::now()
                .duration_since(session.created_at())
                .map_or(0, |d| d.as_secs()),
            idle_ms: u64::try_from(session.idle_for().as_millis()).unwrap_or(u64::MAX),
            rtt_ms: session
                .rtt()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

impl SessionRegistry {
    pub fn new(metrics: Arc<TunnelMetrics>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            metrics,
        }
    }

    /// Make `session` the routable session for its identity, superseding any
    /// previous one.
    pub async fn install(&self, session: Session) {
        let identity = session.identity().to_string();
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.remove(&identity) {
            info!(
                customer = %session.customer_hash(),
                old_session = %old.id(),
                new_session = %session.id(),
                "Superseding existing session"
            );
            old.terminate(TunnelError::SessionSuperseded);
            self.metrics.session_superseded();
        }
        sessions.insert(identity, session);
    }

    /// The ACTIVE session for `identity`.
    pub async fn get_active(&self, identity: &str) -> Result<Session, TunnelError> {
        let sessions = self.sessions.read().await;
        match sessions.get(identity) {
            Some(session) if session.state() == SessionState::Active => Ok(session.clone()),
            _ => Err(TunnelError::NoActiveTunnel(identity.to_string())),
        }
    }

    /// Remove the entry for `session`'s identity, but only if it is still this
    /// session. A superseded session ending late must not evict its successor.
    pub async fn remove_if_current(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(session.identity())
            .is_some_and(|s| s.same_as(session));
        if current {
            sessions.remove(session.identity());
        }
        current
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Summary of whatever session is registered for `identity`, active or not.
    pub async fn summary(&self, identity: &str) -> Option<SessionSummary> {
        self.sessions
            .read()
            .await
            .get(identity)
            .map(SessionSummary::of)
    }

    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<_> = sessions.values().map(SessionSummary::of).collect();
        out.sort_by(|a, b| a.customer_hash.cmp(&b.customer_hash));
        out
    }

    /// Drain every session concurrently and clear the map (bridge shutdown).
    pub async fn drain_all(&self, grace: Duration) {
        let sessions: Vec<Session> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Draining sessions for shutdown");
        futures_util::future::join_all(sessions.iter().map(|s| s.drain(grace))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::session::tests::session_pair;
    use crate::tunnel::session::SessionParams;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(TunnelMetrics::new("bridge")))
    }

    #[tokio::test]
    async fn lookup_without_session_is_no_active_tunnel() {
        let reg = registry();
        assert_eq!(
            reg.get_active("acme").await.unwrap_err(),
            TunnelError::NoActiveTunnel("acme".into())
        );
    }

    #[tokio::test]
    async fn newer_session_supersedes_older() {
        let reg = registry();
        let ((old_connector, _), (old_bridge, _)) =
            session_pair(64 * 1024, SessionParams::default()).await;
        let ((_new_connector, _), (new_bridge, _)) =
            session_pair(64 * 1024, SessionParams::default()).await;

        reg.install(old_bridge.clone()).await;
        reg.install(new_bridge.clone()).await;

        assert_eq!(old_bridge.closed().await, TunnelError::SessionSuperseded);
        assert_eq!(
            old_connector.closed().await,
            TunnelError::SessionSuperseded
        );
        let active = reg.get_active("acme").await.unwrap();
        assert!(active.same_as(&new_bridge));
        assert_eq!(reg.len().await, 1);
        assert!(reg
            .metrics
            .render()
            .contains("tunnel_sessions_superseded_total{role=\"bridge\"} 1"));

        // The superseded session's cleanup must not evict the new one.
        assert!(!reg.remove_if_current(&old_bridge).await);
        assert!(reg.get_active("acme").await.is_ok());
        assert!(reg.remove_if_current(&new_bridge).await);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_installs_leave_one_survivor() {
        let reg = registry();
        let mut bridges = Vec::new();
        let mut keep = Vec::new();
        for _ in 0..4 {
            let ((connector, c_in), (bridge, b_in)) =
                session_pair(64 * 1024, SessionParams::default()).await;
            bridges.push(bridge);
            keep.push((connector, c_in, b_in));
        }

        let installs = bridges.iter().cloned().map(|b| {
            let reg = reg.clone();
            tokio::spawn(async move { reg.install(b).await })
        });
        for task in installs.collect::<Vec<_>>() {
            task.await.unwrap();
        }

        let survivor = reg.get_active("acme").await.unwrap();
        let mut superseded = 0;
        for b in &bridges {
            if b.same_as(&survivor) {
                assert!(b.is_active());
            } else {
                assert_eq!(b.closed().await, TunnelError::SessionSuperseded);
                superseded += 1;
            }
        }
        assert_eq!(superseded, 3);
        drop(keep);
    }

    #[tokio::test]
    async fn snapshot_hides_identity() {
        let reg = registry();
        let ((_c, _), (bridge, _)) = session_pair(64 * 1024, SessionParams::default()).await;
        reg.install(bridge.clone()).await;
        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].session_id, bridge.id());
        assert_eq!(snap[0].state, "active");
        let json = serde_json::to_string(&snap).unwrap();
        assert!(!json.contains("acme"));
    }

    #[tokio::test]
    async fn drain_all_closes_everything() {
        let reg = registry();
        let ((connector, _), (bridge, _)) = session_pair(64 * 1024, SessionParams::default()).await;
        reg.install(bridge.clone()).await;
        reg.drain_all(Duration::from_millis(100)).await;
        assert!(reg.is_empty().await);
        assert_eq!(bridge.state(), SessionState::Closed);
        assert_eq!(connector.closed().await, TunnelError::GoingAway);
    }
}

//! Tunnel counters and their plain-text exposition for `GET /metrics`.
//!
//! All counters are atomics so the session hot path never takes a lock.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide tunnel metrics, shared by every session of one role.
#[derive(Debug)]
pub struct TunnelMetrics {
    role: &'static str,
    sessions_active: AtomicI64,
    streams_open: AtomicI64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    handshake_failures: AtomicU64,
    reconnects: AtomicU64,
    sessions_superseded: AtomicU64,
    no_active_tunnel: AtomicU64,
}

impl TunnelMetrics {
    /// `role` becomes the `role` label on every line (`bridge` / `connector`).
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            sessions_active: AtomicI64::new(0),
            streams_open: AtomicI64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            sessions_superseded: AtomicU64::new(0),
            no_active_tunnel: AtomicU64::new(0),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.streams_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        self.streams_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_superseded(&self) {
        self.sessions_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn no_active_tunnel(&self) {
        self.no_active_tunnel.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_active(&self) -> u64 {
        clamp(self.sessions_active.load(Ordering::Relaxed))
    }

    pub fn streams_open(&self) -> u64 {
        clamp(self.streams_open.load(Ordering::Relaxed))
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Render every metric as `name{labels} value` lines with HELP/TYPE headers.
    pub fn render(&self) -> String {
        let rows: [(&str, &str, &str, u64); 8] = [
            (
                "tunnel_sessions_active",
                "gauge",
                "Tunnel sessions currently established",
                self.sessions_active(),
            ),
            (
                "tunnel_streams_open",
                "gauge",
                "Streams currently open across all sessions",
                self.streams_open(),
            ),
            (
                "tunnel_bytes_in_total",
                "counter",
                "DATA payload bytes received",
                self.bytes_in(),
            ),
            (
                "tunnel_bytes_out_total",
                "counter",
                "DATA payload bytes sent",
                self.bytes_out(),
            ),
            (
                "tunnel_handshake_failures_total",
                "counter",
                "Handshakes that were rejected or did not complete",
                self.handshake_failures(),
            ),
            (
                "tunnel_reconnects_total",
                "counter",
                "Redials scheduled by the reconnection controller",
                self.reconnects(),
            ),
            (
                "tunnel_sessions_superseded_total",
                "counter",
                "Sessions replaced by a newer handshake for the same identity",
                self.sessions_superseded.load(Ordering::Relaxed),
            ),
            (
                "tunnel_no_active_tunnel_total",
                "counter",
                "Requests that found no active session for their customer",
                self.no_active_tunnel.load(Ordering::Relaxed),
            ),
        ];

        let mut out = String::with_capacity(1024);
        for (name, kind, help, value) in rows {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            let _ = writeln!(out, "{name}{{role=\"{}\"}} {value}", self.role);
        }
        out
    }
}

fn clamp(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_required_series() {
        let m = TunnelMetrics::new("bridge");
        m.session_opened();
        m.stream_opened();
        m.stream_opened();
        m.stream_closed();
        m.add_bytes_in(10);
        m.add_bytes_out(7);
        m.handshake_failed();

        let text = m.render();
        for line in [
            "tunnel_sessions_active{role=\"bridge\"} 1",
            "tunnel_streams_open{role=\"bridge\"} 1",
            "tunnel_bytes_in_total{role=\"bridge\"} 10",
            "tunnel_bytes_out_total{role=\"bridge\"} 7",
            "tunnel_handshake_failures_total{role=\"bridge\"} 1",
        ] {
            assert!(text.lines().any(|l| l == line), "missing {line}\n{text}");
        }
        assert!(text.contains("# TYPE tunnel_bytes_in_total counter"));
    }

    #[test]
    fn gauges_never_render_negative() {
        let m = TunnelMetrics::new("connector");
        m.session_closed();
        assert_eq!(m.sessions_active(), 0);
        assert!(m.render().contains("tunnel_sessions_active{role=\"connector\"} 0"));
    }
}

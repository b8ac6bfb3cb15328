//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RTUN_MODE`, `RTUN_IDENTITY`,
//!    `RTUN_SECRET_B64`, `RTUN_BRIDGE_ADDR`, `RTUN_TUNNEL_LISTEN`,
//!    `RTUN_HTTP_LISTEN`, `RTUN_UPSTREAM`, `RTUN_CUSTOMER_ID`
//! 2. **Config file**: path via `--config <path>` (`.toml`, `.yaml`, `.yml`),
//!    or `rtun.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! mode = "reverse_tunnel"   # container_bridge | api_proxy | vpn_gateway
//!
//! [bridge]
//! tunnel_listen = "0.0.0.0:8443"
//! http_listen = "127.0.0.1:8080"
//! proxy_timeout_secs = 60
//!
//! [[customers]]
//! identity = "acme"
//! secret_b64 = "…"          # >= 32 bytes once decoded
//!
//! [connector]
//! bridge_addr = "bridge.example.com:8443"
//! identity = "acme"
//! secret_b64 = "…"
//! upstream = "127.0.0.1:8000"
//!
//! [protocol]
//! initial_window = 262144
//! keepalive_interval_secs = 30
//! keepalive_timeout_secs = 90
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_delay_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::{self, Secret, StaticSecrets, MIN_SECRET_LEN};
use crate::state::TunnelStats;
use crate::tunnel::frame::MAX_PAYLOAD_LEN;
use crate::tunnel::handshake::LocalParams;
use crate::tunnel::reconnect::Backoff;
use crate::tunnel::routing::Mode;
use crate::tunnel::session::SessionParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which end of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Bridge,
    Connector,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Connector => "connector",
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    /// Identities the bridge accepts. Ignored by the connector.
    #[serde(default)]
    pub customers: Vec<CustomerConfig>,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Bridge listeners and proxy limits.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Where connectors dial in (default `0.0.0.0:8443`).
    #[serde(default = "default_tunnel_listen")]
    pub tunnel_listen: String,
    /// HTTP front for the reverse proxy, `/health` and `/metrics`
    /// (default `127.0.0.1:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Upper bound on one forwarded request, headers included (default 60).
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Maximum concurrent requests on the HTTP front (default 1024).
    #[serde(default = "default_max_http_requests")]
    pub max_http_requests: usize,
    /// Seconds sessions get to finish streams on shutdown (default 10).
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,
    /// Where streams opened by connectors are relayed (e.g. a cloud API).
    /// Unset means connector-opened streams are refused.
    pub cloud_upstream: Option<String>,
}

/// Connector identity, bridge address and on-prem upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Bridge tunnel address `host:port` (default `127.0.0.1:8443`).
    #[serde(default = "default_bridge_addr")]
    pub bridge_addr: String,
    /// Identity presented in HELLO. Override with `RTUN_IDENTITY`.
    #[serde(default)]
    pub identity: String,
    /// Base64 shared secret. Override with `RTUN_SECRET_B64`.
    #[serde(default)]
    pub secret_b64: String,
    /// Customer id reported by `/health`. Override with `RTUN_CUSTOMER_ID`.
    #[serde(default)]
    pub customer_id: String,
    /// On-prem service that bridge-opened streams are relayed to
    /// (default `127.0.0.1:80`).
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Optional local TCP listener whose connections are carried to the
    /// bridge as connector-opened streams.
    pub local_listen: Option<String>,
    /// Connector `/health` and `/metrics` listener (default `127.0.0.1:9090`).
    #[serde(default = "default_health_listen")]
    pub health_listen: String,
    /// Wrap the tunnel in TLS (default false).
    #[serde(default)]
    pub tls: bool,
    /// TLS server name; defaults to the host part of `bridge_addr`.
    pub tls_domain: Option<String>,
    /// Seconds allowed for TCP/TLS connect (default 10).
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerConfig {
    pub identity: String,
    pub secret_b64: String,
}

/// Wire protocol tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Per-stream receive window in bytes (default 256 KiB).
    #[serde(default = "default_initial_window")]
    pub initial_window: u32,
    /// Largest DATA payload accepted (default and maximum 64 KiB).
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: u32,
    /// Concurrent streams per session (default 256).
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    /// Peer-opened streams queued for accept (default 64).
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Accepted clock difference for HELLO timestamps (default 120).
    #[serde(default = "default_timestamp_skew")]
    pub timestamp_skew_secs: u64,
}

/// Connector redial schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Seconds a session must stay ACTIVE before the attempt count resets.
    #[serde(default = "default_reset_after")]
    pub reset_after_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `rtun supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_tunnel_listen() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_http_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_proxy_timeout() -> u64 {
    60
}
fn default_max_http_requests() -> usize {
    1024
}
fn default_drain_grace() -> u64 {
    10
}
fn default_bridge_addr() -> String {
    "127.0.0.1:8443".to_string()
}
fn default_upstream() -> String {
    "127.0.0.1:80".to_string()
}
fn default_health_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_initial_window() -> u32 {
    256 * 1024
}
#[allow(clippy::cast_possible_truncation)]
fn default_max_frame_payload() -> u32 {
    MAX_PAYLOAD_LEN as u32
}
fn default_max_streams() -> usize {
    256
}
fn default_accept_backlog() -> usize {
    64
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_keepalive_timeout() -> u64 {
    90
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_timestamp_skew() -> u64 {
    120
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_reset_after() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tunnel_listen: default_tunnel_listen(),
            http_listen: default_http_listen(),
            proxy_timeout_secs: default_proxy_timeout(),
            max_http_requests: default_max_http_requests(),
            drain_grace_secs: default_drain_grace(),
            cloud_upstream: None,
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            bridge_addr: default_bridge_addr(),
            identity: String::new(),
            secret_b64: String::new(),
            customer_id: String::new(),
            upstream: default_upstream(),
            local_listen: None,
            health_listen: default_health_listen(),
            tls: false,
            tls_domain: None,
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            initial_window: default_initial_window(),
            max_frame_payload: default_max_frame_payload(),
            max_streams: default_max_streams(),
            accept_backlog: default_accept_backlog(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            timestamp_skew_secs: default_timestamp_skew(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            reset_after_secs: default_reset_after(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl ProtocolConfig {
    pub fn local_params(&self) -> LocalParams {
        LocalParams {
            max_frame_payload: self.max_frame_payload,
            initial_window: self.initial_window,
        }
    }

    pub fn session_params(&self, stats: Option<Arc<TunnelStats>>) -> SessionParams {
        SessionParams {
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
            max_streams: self.max_streams,
            accept_backlog: self.accept_backlog,
            stats,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn timestamp_skew(&self) -> Duration {
        Duration::from_secs(self.timestamp_skew_secs)
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_secs(self.max_delay_secs),
            Duration::from_secs(self.reset_after_secs),
        )
    }
}

/// Decode a base64 secret and enforce the minimum length.
pub fn decode_secret(b64: &str) -> Result<Secret, ConfigError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| ConfigError::Invalid(format!("secret is not valid base64: {e}")))?;
    if bytes.len() < MIN_SECRET_LEN {
        return Err(ConfigError::Invalid(format!(
            "secret must be at least {MIN_SECRET_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Secret::new(bytes))
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `rtun.toml` in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("rtun.toml").exists() => Self::from_file("rtun.toml")?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse `content`; the format follows the extension of `path`.
    pub fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("toml");
        let parsed = match ext {
            "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            _ => toml::from_str(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_string(),
            message,
        })
    }

    /// Apply `RTUN_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("RTUN_MODE") {
            self.mode = mode.parse().map_err(ConfigError::Invalid)?;
        }
        if let Some(identity) = lookup("RTUN_IDENTITY") {
            self.connector.identity = identity;
        }
        if let Some(secret) = lookup("RTUN_SECRET_B64") {
            self.connector.secret_b64 = secret;
        }
        if let Some(addr) = lookup("RTUN_BRIDGE_ADDR") {
            self.connector.bridge_addr = addr;
        }
        if let Some(listen) = lookup("RTUN_TUNNEL_LISTEN") {
            self.bridge.tunnel_listen = listen;
        }
        if let Some(listen) = lookup("RTUN_HTTP_LISTEN") {
            self.bridge.http_listen = listen;
        }
        if let Some(upstream) = lookup("RTUN_UPSTREAM") {
            self.connector.upstream = upstream;
        }
        if let Some(id) = lookup("RTUN_CUSTOMER_ID") {
            self.connector.customer_id = id;
        }
        // Single-tenant bridges can be configured from the environment alone.
        if self.customers.is_empty()
            && !self.connector.identity.is_empty()
            && !self.connector.secret_b64.is_empty()
        {
            self.customers.push(CustomerConfig {
                identity: self.connector.identity.clone(),
                secret_b64: self.connector.secret_b64.clone(),
            });
        }
        Ok(())
    }

    /// Check everything `role` needs before any listener is bound.
    pub fn validate(&self, role: Role) -> Result<(), ConfigError> {
        let p = &self.protocol;
        if p.initial_window == 0 {
            return Err(ConfigError::Invalid("protocol.initial_window must be > 0".into()));
        }
        if p.max_frame_payload == 0 || p.max_frame_payload as usize > MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid(format!(
                "protocol.max_frame_payload must be 1..={MAX_PAYLOAD_LEN}"
            )));
        }
        if p.max_streams == 0 {
            return Err(ConfigError::Invalid("protocol.max_streams must be > 0".into()));
        }
        if p.keepalive_interval_secs == 0 || p.keepalive_timeout_secs <= p.keepalive_interval_secs
        {
            return Err(ConfigError::Invalid(
                "protocol.keepalive_timeout_secs must exceed a non-zero keepalive_interval_secs"
                    .into(),
            ));
        }

        match role {
            Role::Bridge => {
                if self.mode == Mode::VpnGateway {
                    return Err(ConfigError::Invalid(
                        "vpn_gateway mode bypasses the tunnel; the bridge has nothing to serve"
                            .into(),
                    ));
                }
                if self.customers.is_empty() {
                    return Err(ConfigError::Invalid(
                        "at least one [[customers]] entry is required".into(),
                    ));
                }
                let mut seen = HashSet::new();
                for c in &self.customers {
                    check_identity(&c.identity)?;
                    if !seen.insert(c.identity.as_str()) {
                        return Err(ConfigError::Invalid(format!(
                            "duplicate customer identity '{}'",
                            c.identity
                        )));
                    }
                    decode_secret(&c.secret_b64)?;
                }
            }
            Role::Connector => {
                check_identity(&self.connector.identity)?;
                decode_secret(&self.connector.secret_b64)?;
                if self.connector.upstream.is_empty() {
                    return Err(ConfigError::Invalid("connector.upstream is empty".into()));
                }
            }
        }
        Ok(())
    }

    /// Secret table for the bridge's authenticator.
    pub fn secrets(&self) -> Result<StaticSecrets, ConfigError> {
        let mut secrets = StaticSecrets::new();
        for c in &self.customers {
            secrets.insert(c.identity.clone(), decode_secret(&c.secret_b64)?);
        }
        Ok(secrets)
    }

    pub fn connector_secret(&self) -> Result<Secret, ConfigError> {
        decode_secret(&self.connector.secret_b64)
    }
}

fn check_identity(identity: &str) -> Result<(), ConfigError> {
    if auth::is_valid_identity(identity) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "identity '{identity}' must be 1-255 chars of [A-Za-z0-9._-]"
        )))
    }
}

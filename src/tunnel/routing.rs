//! Per-request routing decision on the bridge's HTTP front.

use std::fmt;
use std::str::FromStr;

use axum::http::{Method, StatusCode};
use serde::{Deserialize, Serialize};

/// Deployment architecture. Only changes what the bridge does with a request;
/// the tunnel protocol is identical in every mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    ReverseTunnel,
    ContainerBridge,
    ApiProxy,
    /// Label only: tunneling is handled outside this process.
    VpnGateway,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReverseTunnel => "reverse_tunnel",
            Self::ContainerBridge => "container_bridge",
            Self::ApiProxy => "api_proxy",
            Self::VpnGateway => "vpn_gateway",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reverse_tunnel" => Ok(Self::ReverseTunnel),
            "container_bridge" => Ok(Self::ContainerBridge),
            "api_proxy" => Ok(Self::ApiProxy),
            "vpn_gateway" => Ok(Self::VpnGateway),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Path under `/t/{customer}/` that the bridge answers itself.
pub const STATUS_PATH: &str = "_tunnel/status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Open a stream on the customer's session and relay the request.
    Forward,
    /// Answer with the customer's tunnel status.
    LocalStatus,
    /// Answer locally with a fixed status; no session is touched.
    Reject(StatusCode, &'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct RoutingPolicy {
    mode: Mode,
}

impl RoutingPolicy {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// `rest` is the path after `/t/{customer}/`, without a leading slash.
    pub fn decide(&self, method: &Method, rest: &str, is_upgrade: bool) -> Decision {
        if self.mode == Mode::VpnGateway {
            return Decision::Reject(
                StatusCode::NOT_IMPLEMENTED,
                "routing is bypassed in vpn_gateway mode",
            );
        }
        if method == Method::GET && rest.trim_end_matches('/') == STATUS_PATH {
            return Decision::LocalStatus;
        }
        if is_upgrade && self.mode == Mode::ApiProxy {
            return Decision::Reject(
                StatusCode::NOT_IMPLEMENTED,
                "websocket upgrades are not proxied in api_proxy mode",
            );
        }
        Decision::Forward
    }
}

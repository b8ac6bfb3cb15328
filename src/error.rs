//! Error taxonomy shared by the codec, multiplexer, handshake and session layers.
//!
//! Every error that crosses the wire maps to an [`ErrorCode`] carried in an
//! `ERROR` frame. Stream I/O surfaces errors as [`std::io::Error`] whose inner
//! value is the originating [`TunnelError`].

use std::io;

use thiserror::Error;

/// Numeric code carried in the first two bytes of an `ERROR` frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    AuthFailed = 1,
    SessionSuperseded = 2,
    ProtocolError = 3,
    WindowViolation = 4,
    KeepaliveTimeout = 5,
    StreamReset = 6,
    StreamRefused = 7,
    GoingAway = 8,
    Internal = 9,
}

impl ErrorCode {
    /// Unknown codes collapse to [`ErrorCode::Internal`].
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::AuthFailed,
            2 => Self::SessionSuperseded,
            3 => Self::ProtocolError,
            4 => Self::WindowViolation,
            5 => Self::KeepaliveTimeout,
            6 => Self::StreamReset,
            7 => Self::StreamRefused,
            8 => Self::GoingAway,
            _ => Self::Internal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::SessionSuperseded => "SESSION_SUPERSEDED",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::WindowViolation => "WINDOW_VIOLATION",
            Self::KeepaliveTimeout => "KEEPALIVE_TIMEOUT",
            Self::StreamReset => "STREAM_RESET",
            Self::StreamRefused => "STREAM_REFUSED",
            Self::GoingAway => "GOING_AWAY",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Everything that can go wrong inside the tunnel core.
///
/// The type is `Clone` because a single session failure is delivered to every
/// stream that was waiting on the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// Malformed bytes on the wire. Fatal to the session.
    #[error("framing error: {0}")]
    Framing(String),
    /// Bad proof, unknown identity or stale timestamp. Fatal to the handshake.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// A newer handshake for the same identity replaced this session.
    #[error("session superseded by a newer connection")]
    SessionSuperseded,
    /// Peer sent more DATA than its credit allowed.
    #[error("flow-control window violated on stream {stream_id}")]
    WindowViolation { stream_id: u32 },
    /// Frame is well-formed but not allowed in the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Routing found no ACTIVE session for the customer. Retryable.
    #[error("no active tunnel for customer '{0}'")]
    NoActiveTunnel(String),
    /// No PONG within the keepalive timeout.
    #[error("keepalive timeout")]
    KeepaliveTimeout,
    /// Peer reset one stream. Scoped to that stream.
    #[error("stream reset by peer ({}): {message}", code.as_str())]
    StreamReset { code: ErrorCode, message: String },
    /// Peer refused to open the stream.
    #[error("stream refused by peer")]
    StreamRefused,
    /// Session is draining and accepts no new streams.
    #[error("session is going away")]
    GoingAway,
    /// Peer closed the session with an `ERROR` frame we have no variant for.
    #[error("peer closed session ({}): {message}", code.as_str())]
    Remote { code: ErrorCode, message: String },
    /// Handshake did not complete in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// Transport reached EOF.
    #[error("transport closed")]
    TransportClosed,
    #[error("i/o error: {0}")]
    Io(String),
}

impl TunnelError {
    /// Wire code used when this error is reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthFailed(_) | Self::HandshakeTimeout => ErrorCode::AuthFailed,
            Self::SessionSuperseded => ErrorCode::SessionSuperseded,
            Self::Framing(_) | Self::ProtocolViolation(_) => ErrorCode::ProtocolError,
            Self::WindowViolation { .. } => ErrorCode::WindowViolation,
            Self::KeepaliveTimeout => ErrorCode::KeepaliveTimeout,
            Self::StreamReset { code, .. } | Self::Remote { code, .. } => *code,
            Self::StreamRefused => ErrorCode::StreamRefused,
            Self::GoingAway => ErrorCode::GoingAway,
            Self::NoActiveTunnel(_) | Self::TransportClosed | Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Rebuild the local error for a session-level `ERROR` frame from the peer.
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::AuthFailed => Self::AuthFailed(message),
            ErrorCode::SessionSuperseded => Self::SessionSuperseded,
            ErrorCode::KeepaliveTimeout => Self::KeepaliveTimeout,
            ErrorCode::GoingAway => Self::GoingAway,
            _ => Self::Remote { code, message },
        }
    }

    /// Whether an `ERROR` frame should be attempted on teardown. Errors that
    /// originate from the peer or from a dead transport are not echoed back.
    pub fn should_notify_peer(&self) -> bool {
        !matches!(
            self,
            Self::Remote { .. } | Self::TransportClosed | Self::Io(_)
        )
    }

    /// Whether the failure belongs to the handshake/auth class.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailed(_) | Self::HandshakeTimeout)
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::TransportClosed,
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = match &err {
            TunnelError::StreamReset { .. } | TunnelError::StreamRefused => {
                io::ErrorKind::ConnectionReset
            }
            TunnelError::GoingAway | TunnelError::NoActiveTunnel(_) => {
                io::ErrorKind::NotConnected
            }
            _ => io::ErrorKind::ConnectionAborted,
        };
        io::Error::new(kind, err)
    }
}

//! Connector-initiated handshake.
//!
//! ```text
//! connector                                   bridge
//!   IDLE ── HELLO{nonce, ts, proof, ...} ──▶   verify proof / skew / identity
//!   AWAIT_ACK ◀── HELLO_ACK{session_id} ────   (success)
//!   AWAIT_ACK ◀── ERROR{AUTH_FAILED} ───────   (failure, transport closed)
//! ```
//!
//! There are no retries here. A rejected connector backs off through the
//! reconnection controller exactly like a transport failure.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;
use uuid::Uuid;

use super::frame::{Frame, FrameCodec, FrameType, MAX_PAYLOAD_LEN};
use crate::auth::{self, Secret, SecretProvider};
use crate::error::{ErrorCode, TunnelError};

pub const PROTOCOL_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 16;
pub const PROOF_LEN: usize = 32;

const HELLO_FIXED_LEN: usize = 1 + NONCE_LEN + 8 + PROOF_LEN + 4 + 4 + 2;
const HELLO_ACK_LEN: usize = 16 + 4 + 4;

/// What this side advertises during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalParams {
    /// Largest DATA payload this side is willing to receive.
    pub max_frame_payload: u32,
    /// Initial receive window per stream on this side.
    pub initial_window: u32,
}

/// Result of a successful handshake, from the local side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub session_id: Uuid,
    pub max_frame_payload: u32,
    /// Initial credit for streams we send on (the peer's receive window).
    pub send_window: u32,
    /// Initial credit we grant the peer per stream.
    pub recv_window: u32,
}

/// HELLO payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub nonce: [u8; NONCE_LEN],
    pub timestamp: u64,
    pub proof: [u8; PROOF_LEN],
    pub max_frame_payload: u32,
    pub initial_window: u32,
    pub identity: String,
}

impl Hello {
    /// Build a signed HELLO with a fresh random nonce.
    pub fn sign(identity: &str, secret: &Secret, params: LocalParams, timestamp: u64) -> Self {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let proof = auth::compute_proof(secret, &nonce, identity, timestamp);
        Self {
            nonce,
            timestamp,
            proof,
            max_frame_payload: params.max_frame_payload,
            initial_window: params.initial_window,
            identity: identity.to_string(),
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(HELLO_FIXED_LEN + self.identity.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.nonce);
        buf.put_u64(self.timestamp);
        buf.extend_from_slice(&self.proof);
        buf.put_u32(self.max_frame_payload);
        buf.put_u32(self.initial_window);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16(self.identity.len() as u16);
        buf.extend_from_slice(self.identity.as_bytes());
        Frame::new(FrameType::Hello, 0, 0, buf.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, TunnelError> {
        if frame.frame_type != FrameType::Hello || frame.stream_id != 0 {
            return Err(TunnelError::ProtocolViolation(format!(
                "expected HELLO on stream 0, got {} on stream {}",
                frame.frame_type.as_str(),
                frame.stream_id
            )));
        }
        let mut buf: &[u8] = &frame.payload;
        if buf.len() < HELLO_FIXED_LEN {
            return Err(TunnelError::Framing("HELLO payload too short".into()));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TunnelError::ProtocolViolation(format!(
                "unsupported protocol version {version}"
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        buf.copy_to_slice(&mut nonce);
        let timestamp = buf.get_u64();
        let mut proof = [0u8; PROOF_LEN];
        buf.copy_to_slice(&mut proof);
        let max_frame_payload = buf.get_u32();
        let initial_window = buf.get_u32();
        let id_len = buf.get_u16() as usize;
        if buf.len() != id_len {
            return Err(TunnelError::Framing(format!(
                "HELLO identity length {id_len} does not match remaining {} bytes",
                buf.len()
            )));
        }
        let identity = std::str::from_utf8(buf)
            .map_err(|_| TunnelError::Framing("HELLO identity is not UTF-8".into()))?
            .to_string();
        Ok(Self {
            nonce,
            timestamp,
            proof,
            max_frame_payload,
            initial_window,
            identity,
        })
    }
}

/// HELLO_ACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAck {
    pub session_id: Uuid,
    pub max_frame_payload: u32,
    pub initial_window: u32,
}

impl HelloAck {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(HELLO_ACK_LEN);
        buf.extend_from_slice(self.session_id.as_bytes());
        buf.put_u32(self.max_frame_payload);
        buf.put_u32(self.initial_window);
        Frame::new(FrameType::HelloAck, 0, 0, buf.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, TunnelError> {
        if frame.payload.len() != HELLO_ACK_LEN {
            return Err(TunnelError::Framing(format!(
                "HELLO_ACK payload must be {HELLO_ACK_LEN} bytes, got {}",
                frame.payload.len()
            )));
        }
        let mut buf: &[u8] = &frame.payload;
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        Ok(Self {
            session_id: Uuid::from_bytes(id),
            max_frame_payload: buf.get_u32(),
            initial_window: buf.get_u32(),
        })
    }
}

/// Connector-side handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitAck,
    Authenticated,
    Rejected,
}

/// Connector-side state machine, independent of any transport.
#[derive(Debug)]
pub struct ConnectorHandshake {
    state: HandshakeState,
    params: LocalParams,
}

impl ConnectorHandshake {
    pub fn new(params: LocalParams) -> Self {
        Self {
            state: HandshakeState::Idle,
            params,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// `IDLE → AWAIT_ACK`: produce the HELLO frame.
    pub fn start(
        &mut self,
        identity: &str,
        secret: &Secret,
        timestamp: u64,
    ) -> Result<Frame, TunnelError> {
        if self.state != HandshakeState::Idle {
            return Err(TunnelError::ProtocolViolation(
                "handshake already started".into(),
            ));
        }
        self.state = HandshakeState::AwaitAck;
        Ok(Hello::sign(identity, secret, self.params, timestamp).to_frame())
    }

    /// Feed the bridge's reply.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Negotiated, TunnelError> {
        if self.state != HandshakeState::AwaitAck {
            return Err(TunnelError::ProtocolViolation(
                "no handshake in progress".into(),
            ));
        }
        let result = match frame.frame_type {
            FrameType::HelloAck => HelloAck::from_frame(frame).and_then(|ack| {
                let max = ack.max_frame_payload.min(self.params.max_frame_payload);
                if max == 0 || ack.initial_window == 0 {
                    return Err(TunnelError::ProtocolViolation(
                        "bridge advertised zero frame size or window".into(),
                    ));
                }
                Ok(Negotiated {
                    session_id: ack.session_id,
                    max_frame_payload: max,
                    send_window: ack.initial_window,
                    recv_window: self.params.initial_window,
                })
            }),
            FrameType::Error => {
                let (code, message) = frame.error_parts()?;
                Err(TunnelError::from_remote(code, message))
            }
            other => Err(TunnelError::ProtocolViolation(format!(
                "expected HELLO_ACK, got {}",
                other.as_str()
            ))),
        };
        self.state = if result.is_ok() {
            HandshakeState::Authenticated
        } else {
            HandshakeState::Rejected
        };
        result
    }
}

/// Bridge side: validate a HELLO against the secret provider.
///
/// Unknown identity, wrong proof and stale timestamp all yield
/// [`TunnelError::AuthFailed`].
pub fn verify_hello(
    frame: &Frame,
    provider: &dyn SecretProvider,
    now_secs: u64,
    skew_secs: u64,
) -> Result<Hello, TunnelError> {
    let hello = Hello::from_frame(frame)?;

    if !auth::is_valid_identity(&hello.identity) {
        return Err(TunnelError::AuthFailed("malformed identity".into()));
    }
    let Some(secret) = provider.lookup_secret(&hello.identity) else {
        return Err(TunnelError::AuthFailed("unknown identity".into()));
    };
    if !auth::verify_proof(
        &secret,
        &hello.nonce,
        &hello.identity,
        hello.timestamp,
        &hello.proof,
    ) {
        return Err(TunnelError::AuthFailed("proof mismatch".into()));
    }
    if now_secs.abs_diff(hello.timestamp) > skew_secs {
        return Err(TunnelError::AuthFailed(format!(
            "timestamp outside ±{skew_secs}s window"
        )));
    }
    if hello.max_frame_payload == 0 || hello.initial_window == 0 {
        return Err(TunnelError::ProtocolViolation(
            "connector advertised zero frame size or window".into(),
        ));
    }
    Ok(hello)
}

/// Outcome of [`accept`].
#[derive(Debug, Clone)]
pub struct Accepted {
    pub identity: String,
    pub customer_hash: String,
    pub negotiated: Negotiated,
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

async fn next_frame<T>(
    framed: &mut Framed<T, FrameCodec>,
    timeout: Duration,
) -> Result<Frame, TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => Err(TunnelError::HandshakeTimeout),
        Ok(None) => Err(TunnelError::TransportClosed),
        Ok(Some(frame)) => frame,
    }
}

/// Run the connector side over `framed`.
pub async fn connect<T>(
    framed: &mut Framed<T, FrameCodec>,
    identity: &str,
    secret: &Secret,
    params: LocalParams,
    timeout: Duration,
) -> Result<Negotiated, TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut machine = ConnectorHandshake::new(params);
    let hello = machine.start(identity, secret, unix_now())?;
    framed.send(hello).await?;
    let reply = next_frame(framed, timeout).await?;
    machine.on_frame(&reply)
}

/// Run the bridge side over `framed`. On any failure an `ERROR{AUTH_FAILED}`
/// is attempted before returning; the caller closes the transport.
pub async fn accept<T>(
    framed: &mut Framed<T, FrameCodec>,
    provider: &dyn SecretProvider,
    params: LocalParams,
    skew: Duration,
    timeout: Duration,
) -> Result<Accepted, TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = match next_frame(framed, timeout).await {
        Ok(frame) => verify_hello(&frame, provider, unix_now(), skew.as_secs()),
        Err(TunnelError::TransportClosed) => return Err(TunnelError::TransportClosed),
        Err(e) => Err(e),
    };

    let hello = match outcome {
        Ok(hello) => hello,
        Err(e) => {
            debug!(error = %e, "Handshake rejected");
            // The reason stays local; the peer only learns that it failed.
            let _ = framed
                .send(Frame::error(0, ErrorCode::AuthFailed, "authentication failed"))
                .await;
            return Err(e);
        }
    };

    #[allow(clippy::cast_possible_truncation)]
    let max_frame_payload = hello
        .max_frame_payload
        .min(params.max_frame_payload)
        .min(MAX_PAYLOAD_LEN as u32);
    let negotiated = Negotiated {
        session_id: Uuid::new_v4(),
        max_frame_payload,
        send_window: hello.initial_window,
        recv_window: params.initial_window,
    };
    let ack = HelloAck {
        session_id: negotiated.session_id,
        max_frame_payload,
        initial_window: params.initial_window,
    };
    framed.send(ack.to_frame()).await?;

    Ok(Accepted {
        customer_hash: auth::customer_hash(&hello.identity),
        identity: hello.identity,
        negotiated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticSecrets;

    const NOW: u64 = 1_760_000_000;
    const SKEW: u64 = 120;

    fn params() -> LocalParams {
        LocalParams {
            max_frame_payload: 16 * 1024,
            initial_window: 256 * 1024,
        }
    }

    fn secret(byte: u8) -> Secret {
        Secret::new(vec![byte; 32])
    }

    fn provider() -> StaticSecrets {
        StaticSecrets::new().with("acme", secret(1))
    }

    #[test]
    fn hello_round_trips_through_frame() {
        let hello = Hello::sign("acme", &secret(1), params(), NOW);
        let parsed = Hello::from_frame(&hello.to_frame()).unwrap();
        assert_eq!(parsed, hello);
    }

    #[test]
    fn hello_nonces_are_fresh() {
        let a = Hello::sign("acme", &secret(1), params(), NOW);
        let b = Hello::sign("acme", &secret(1), params(), NOW);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn correct_secret_is_accepted() {
        let frame = Hello::sign("acme", &secret(1), params(), NOW).to_frame();
        let hello = verify_hello(&frame, &provider(), NOW, SKEW).unwrap();
        assert_eq!(hello.identity, "acme");
    }

    #[test]
    fn wrong_secret_is_rejected_regardless_of_timestamp() {
        for ts in [NOW, NOW - SKEW, NOW + SKEW, NOW - 10 * SKEW] {
            let frame = Hello::sign("acme", &secret(2), params(), ts).to_frame();
            let err = verify_hello(&frame, &provider(), NOW, SKEW).unwrap_err();
            assert!(matches!(err, TunnelError::AuthFailed(_)), "ts={ts}: {err}");
        }
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let frame = Hello::sign("acme", &secret(1), params(), NOW - SKEW - 1).to_frame();
        let err = verify_hello(&frame, &provider(), NOW, SKEW).unwrap_err();
        assert!(matches!(err, TunnelError::AuthFailed(m) if m.contains("timestamp")));

        let future = Hello::sign("acme", &secret(1), params(), NOW + SKEW + 1).to_frame();
        assert!(verify_hello(&future, &provider(), NOW, SKEW).is_err());

        let edge = Hello::sign("acme", &secret(1), params(), NOW - SKEW).to_frame();
        assert!(verify_hello(&edge, &provider(), NOW, SKEW).is_ok());
    }

    #[test]
    fn unknown_identity_is_rejected() {
        let frame = Hello::sign("globex", &secret(1), params(), NOW).to_frame();
        let err = verify_hello(&frame, &provider(), NOW, SKEW).unwrap_err();
        assert!(matches!(err, TunnelError::AuthFailed(m) if m.contains("unknown")));
    }

    #[test]
    fn tampered_identity_is_rejected() {
        let mut hello = Hello::sign("acme", &secret(1), params(), NOW);
        hello.identity = "acmf".into();
        let provider = provider().with("acmf", secret(1));
        assert!(verify_hello(&hello.to_frame(), &provider, NOW, SKEW).is_err());
    }

    #[test]
    fn truncated_hello_is_framing_error() {
        let payload = Hello::sign("acme", &secret(1), params(), NOW).to_frame().payload;
        let frame = Frame::new(FrameType::Hello, 0, 0, payload.slice(..payload.len() - 1));
        assert!(matches!(
            verify_hello(&frame, &provider(), NOW, SKEW),
            Err(TunnelError::Framing(_))
        ));
    }

    #[test]
    fn connector_state_machine_accepts_ack() {
        let mut machine = ConnectorHandshake::new(params());
        assert_eq!(machine.state(), HandshakeState::Idle);
        machine.start("acme", &secret(1), NOW).unwrap();
        assert_eq!(machine.state(), HandshakeState::AwaitAck);

        let ack = HelloAck {
            session_id: Uuid::new_v4(),
            max_frame_payload: 64 * 1024,
            initial_window: 1024,
        };
        let negotiated = machine.on_frame(&ack.to_frame()).unwrap();
        assert_eq!(machine.state(), HandshakeState::Authenticated);
        assert_eq!(negotiated.session_id, ack.session_id);
        assert_eq!(negotiated.max_frame_payload, 16 * 1024);
        assert_eq!(negotiated.send_window, 1024);
        assert_eq!(negotiated.recv_window, 256 * 1024);
    }

    #[test]
    fn connector_state_machine_rejects_on_error() {
        let mut machine = ConnectorHandshake::new(params());
        machine.start("acme", &secret(1), NOW).unwrap();
        let err = machine
            .on_frame(&Frame::error(0, ErrorCode::AuthFailed, "authentication failed"))
            .unwrap_err();
        assert!(matches!(err, TunnelError::AuthFailed(_)));
        assert_eq!(machine.state(), HandshakeState::Rejected);
        assert!(machine.start("acme", &secret(1), NOW).is_err());
    }

    #[tokio::test]
    async fn handshake_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut connector = Framed::new(a, FrameCodec::new());
        let mut bridge = Framed::new(b, FrameCodec::new());
        let provider = provider();
        let key = secret(1);

        let (c, s) = tokio::join!(
            connect(
                &mut connector,
                "acme",
                &key,
                params(),
                Duration::from_secs(5)
            ),
            accept(
                &mut bridge,
                &provider,
                params(),
                Duration::from_secs(SKEW),
                Duration::from_secs(5)
            ),
        );
        let negotiated = c.unwrap();
        let accepted = s.unwrap();
        assert_eq!(negotiated.session_id, accepted.negotiated.session_id);
        assert_eq!(accepted.identity, "acme");
        assert_eq!(accepted.customer_hash, auth::customer_hash("acme"));
    }

    #[tokio::test]
    async fn rejected_handshake_reports_auth_failed_to_connector() {
        let (a, b) = tokio::io::duplex(4096);
        let mut connector = Framed::new(a, FrameCodec::new());
        let mut bridge = Framed::new(b, FrameCodec::new());
        let provider = provider();
        let key = secret(9);

        let (c, s) = tokio::join!(
            connect(
                &mut connector,
                "acme",
                &key,
                params(),
                Duration::from_secs(5)
            ),
            accept(
                &mut bridge,
                &provider,
                params(),
                Duration::from_secs(SKEW),
                Duration::from_secs(5)
            ),
        );
        assert!(matches!(c, Err(TunnelError::AuthFailed(_))));
        assert!(matches!(s, Err(TunnelError::AuthFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (_a, b) = tokio::io::duplex(4096);
        let mut bridge = Framed::new(b, FrameCodec::new());
        let err = accept(
            &mut bridge,
            &provider(),
            params(),
            Duration::from_secs(SKEW),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err, TunnelError::HandshakeTimeout);
    }
}

//! Multiplexed reverse tunnel.
//!
//! A connector dials the bridge over one TCP (optionally TLS) connection,
//! authenticates with an HMAC handshake, and then both ends carry any number
//! of independent byte streams over it:
//!
//! - [`frame`]: 13-byte header wire codec
//! - [`handshake`]: HELLO / HELLO_ACK with replay-bounded proofs
//! - [`mux`]: stream table, credit-based flow control, frame validation
//! - [`session`]: reader/writer/keepalive tasks around one mux
//! - [`registry`]: identity → session on the bridge, with supersede
//! - [`reconnect`]: jittered exponential backoff for the connector
//! - [`routing`]: what the bridge does with each HTTP request per mode
//! - [`bridge`] / [`connector`]: the two process roles

pub mod bridge;
pub mod connector;
pub mod frame;
pub mod handshake;
pub mod mux;
pub mod reconnect;
pub mod registry;
pub mod routing;
pub mod session;
pub mod stream;

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

pub use frame::{Frame, FrameCodec, FrameType};
pub use mux::{SessionState, Side};
pub use registry::{SessionRegistry, SessionSummary};
pub use routing::{Decision, Mode, RoutingPolicy};
pub use session::{Incoming, Session, SessionParams};
pub use stream::{StreamHandle, StreamState};

/// Connect timeout for relaying a stream to a local TCP service.
const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipe a tunnel stream to `addr` until both directions finish.
///
/// If the connect fails the stream is dropped, which resets it on the peer.
pub(crate) async fn relay_to_tcp(mut stream: StreamHandle, addr: &str) -> io::Result<()> {
    let mut upstream = tokio::time::timeout(RELAY_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect {addr} timed out")))??;
    let _ = upstream.set_nodelay(true);
    let (to_upstream, to_tunnel) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    debug!(
        stream_id = stream.id(),
        to_upstream, to_tunnel, "Stream relay finished"
    );
    Ok(())
}

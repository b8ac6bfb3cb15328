//! Byte-stream handles multiplexed over a session.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use super::session::Shared;

/// Lifecycle of one stream.
///
/// ```text
/// OPENING ──OPEN sent──▶ OPEN ──local CLOSE──▶ HALF_CLOSED_LOCAL ──remote CLOSE──▶ CLOSED
///                          └──remote CLOSE──▶ HALF_CLOSED_REMOTE ──local CLOSE──▶ CLOSED
/// any state ──ERROR / session failure──▶ CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// One bidirectional stream. Reads see EOF once the peer closed its half;
/// `shutdown` closes ours. Dropping the handle without a shutdown resets the
/// stream on the peer.
pub struct StreamHandle {
    id: u32,
    shared: Arc<Shared>,
}

impl StreamHandle {
    pub(crate) fn new(id: u32, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.mux().stream_state(self.id)
    }

    /// Refuse a peer-opened stream instead of serving it.
    pub(crate) fn refuse(self) {
        self.shared.mux().refuse(self.id);
        self.shared.wake_writer();
    }

    fn after_op(&self, wake: bool) {
        if wake {
            self.shared.wake_writer();
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("session_id", &self.shared.id)
            .finish()
    }
}

impl AsyncRead for StreamHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let (res, wake) = {
            let mut mux = self.shared.mux();
            let res = mux.poll_read(self.id, cx, buf);
            (res, mux.has_outbound())
        };
        self.after_op(wake);
        res
    }
}

impl AsyncWrite for StreamHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let (res, wake) = {
            let mut mux = self.shared.mux();
            let res = mux.poll_write(self.id, cx, data);
            (res, mux.has_outbound())
        };
        self.after_op(wake);
        res
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Enqueued bytes belong to the session writer from here on.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = self.shared.mux().poll_shutdown(self.id);
        self.after_op(true);
        res
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shared.mux().release(self.id);
        self.shared.wake_writer();
    }
}

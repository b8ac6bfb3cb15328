//! Stream table, per-stream flow control and the outbound scheduler.
//!
//! [`Mux`] is pure state: it never touches the transport. The session's
//! reader task feeds it inbound frames through [`Mux::on_frame`], stream
//! handles drive it through the `poll_*` methods, and the writer task drains
//! it with [`Mux::next_outbound`]. It lives behind one short-held mutex per
//! session, and no lock is ever held across an await.
//!
//! Scheduling: control frames (OPEN, WINDOW_UPDATE, PING/PONG, ERROR) are
//! emitted before any DATA. Streams with sendable data are served round-robin
//! one frame at a time, so a bulk stream cannot starve a small one.
//!
//! Credit: a writer may only enqueue `send_window - pending` bytes, so
//! everything that is enqueued is always sendable. A reader returns credit
//! with a WINDOW_UPDATE once its buffer drops below a quarter of the window.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use tokio::io::ReadBuf;

use super::frame::{Frame, FrameType};
use super::stream::StreamState;
use crate::error::{ErrorCode, TunnelError};
use crate::metrics::TunnelMetrics;

/// Which end of the tunnel this session is. Decides stream-id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Dials out. Opens odd stream ids.
    Connector,
    /// Accepts tunnels. Opens even stream ids.
    Bridge,
}

impl Side {
    fn first_stream_id(self) -> u32 {
        match self {
            Self::Connector => 1,
            Self::Bridge => 2,
        }
    }

    /// Whether `id` is in this side's half of the id space.
    pub fn owns(self, id: u32) -> bool {
        id != 0 && (id % 2 == 1) == (self == Self::Connector)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connector => "connector",
            Self::Bridge => "bridge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// Limits fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MuxConfig {
    pub max_frame_payload: usize,
    pub send_window: u32,
    pub recv_window: u32,
    pub max_streams: usize,
}

/// What the reader task must do after [`Mux::on_frame`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    Handled,
    /// Peer opened a stream; hand it to the acceptor.
    Opened(u32),
    Pong { token: u64 },
}

struct Slot {
    state: StreamState,
    send_window: u32,
    recv_window: u32,
    pending: VecDeque<Bytes>,
    pending_len: usize,
    recv_buf: VecDeque<Bytes>,
    recv_buffered: usize,
    /// Bytes consumed by the reader whose credit was not yet returned.
    unreturned: usize,
    send_seq: u32,
    recv_seq: u32,
    fin_requested: bool,
    /// Handle is gone; the slot only lives to finish a graceful close.
    detached: bool,
    /// Already sitting in the ready queue.
    queued: bool,
    /// Counted in the `streams_open` gauge.
    live: bool,
    error: Option<TunnelError>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Slot {
    fn new(state: StreamState, cfg: &MuxConfig) -> Self {
        Self {
            state,
            send_window: cfg.send_window,
            recv_window: cfg.recv_window,
            pending: VecDeque::new(),
            pending_len: 0,
            recv_buf: VecDeque::new(),
            recv_buffered: 0,
            unreturned: 0,
            send_seq: 0,
            recv_seq: 0,
            fin_requested: false,
            detached: false,
            queued: false,
            live: true,
            error: None,
            read_waker: None,
            write_waker: None,
        }
    }

    fn local_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedLocal | StreamState::Closed)
    }

    fn remote_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedRemote | StreamState::Closed)
    }

    fn wake_reader(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }

    fn retire(&mut self, metrics: &TunnelMetrics) {
        if self.live {
            self.live = false;
            metrics.stream_closed();
        }
    }

    /// Abort the stream: drop queued bytes and surface `err` to both halves.
    fn fail(&mut self, err: TunnelError, metrics: &TunnelMetrics) {
        self.error = Some(err);
        self.state = StreamState::Closed;
        self.pending.clear();
        self.pending_len = 0;
        self.recv_buf.clear();
        self.recv_buffered = 0;
        self.retire(metrics);
        self.wake_reader();
        self.wake_writer();
    }
}

pub(crate) struct Mux {
    side: Side,
    state: SessionState,
    cfg: MuxConfig,
    streams: HashMap<u32, Slot>,
    ready: VecDeque<u32>,
    control: VecDeque<Frame>,
    next_local_id: u32,
    highest_remote_id: u32,
    failure: Option<TunnelError>,
    metrics: Arc<TunnelMetrics>,
}

impl Mux {
    pub(crate) fn new(side: Side, cfg: MuxConfig, metrics: Arc<TunnelMetrics>) -> Self {
        Self {
            side,
            state: SessionState::Active,
            cfg,
            streams: HashMap::new(),
            ready: VecDeque::new(),
            control: VecDeque::new(),
            next_local_id: side.first_stream_id(),
            highest_remote_id: 0,
            failure: None,
            metrics,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn failure(&self) -> Option<&TunnelError> {
        self.failure.as_ref()
    }

    /// Streams that still count against the session (not fully closed).
    pub(crate) fn open_streams(&self) -> usize {
        self.streams.values().filter(|s| s.live).count()
    }

    pub(crate) fn stream_state(&self, id: u32) -> StreamState {
        self.streams.get(&id).map_or(StreamState::Closed, |s| s.state)
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.control.is_empty() || !self.ready.is_empty()
    }

    fn low_water(&self) -> usize {
        (self.cfg.recv_window as usize / 4).max(1)
    }

    /// Ids below our next id (own parity) or at/below the highest peer id
    /// were valid once. Late frames for them are dropped, not fatal.
    fn is_retired(&self, id: u32) -> bool {
        if id == 0 {
            false
        } else if self.side.owns(id) {
            id < self.next_local_id
        } else {
            id <= self.highest_remote_id
        }
    }

    // ---- local operations ----

    pub(crate) fn open_local(&mut self) -> Result<u32, TunnelError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if self.state != SessionState::Active {
            return Err(TunnelError::GoingAway);
        }
        if self.open_streams() >= self.cfg.max_streams {
            return Err(TunnelError::StreamRefused);
        }
        let id = self.next_local_id;
        self.next_local_id = id
            .checked_add(2)
            .ok_or_else(|| TunnelError::ProtocolViolation("stream ids exhausted".into()))?;
        self.streams
            .insert(id, Slot::new(StreamState::Opening, &self.cfg));
        self.metrics.stream_opened();
        self.control.push_back(Frame::open_stream(id));
        Ok(id)
    }

    pub(crate) fn queue_ping(&mut self, sequence: u32, token: u64) {
        self.control.push_back(Frame::ping(sequence, token));
    }

    /// Stop admitting streams in either direction. Returns false if the
    /// session was already past `Active`.
    pub(crate) fn begin_drain(&mut self) -> bool {
        if self.state == SessionState::Active {
            self.state = SessionState::Draining;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Fail every stream with `err` and queue the session-level ERROR frame.
    /// Only the first call has any effect; it returns whether it was first.
    pub(crate) fn fail_all(&mut self, err: &TunnelError) -> bool {
        if self.failure.is_some() {
            return false;
        }
        self.failure = Some(err.clone());
        if self.state != SessionState::Closed {
            self.state = SessionState::Draining;
        }
        for slot in self.streams.values_mut() {
            if slot.error.is_none() {
                slot.fail(err.clone(), &self.metrics);
            }
        }
        self.ready.clear();
        self.control.clear();
        if err.should_notify_peer() {
            self.control
                .push_back(Frame::error(0, err.code(), &err.to_string()));
        }
        true
    }

    /// Reject a peer-opened stream nobody will accept.
    pub(crate) fn refuse(&mut self, id: u32) {
        if let Some(mut slot) = self.streams.remove(&id) {
            slot.retire(&self.metrics);
            if self.failure.is_none() {
                self.control
                    .push_back(Frame::error(id, ErrorCode::StreamRefused, "stream refused"));
            }
        }
    }

    /// The handle for `id` was dropped.
    ///
    /// After a shutdown the slot lingers until the CLOSE has been sent and the
    /// peer closed its half. Without a shutdown the stream is reset.
    pub(crate) fn release(&mut self, id: u32) {
        let Some(slot) = self.streams.get_mut(&id) else {
            return;
        };
        let finished = slot.error.is_some() || slot.state == StreamState::Closed;
        if finished || self.failure.is_some() {
            if let Some(mut slot) = self.streams.remove(&id) {
                slot.retire(&self.metrics);
            }
            return;
        }
        if slot.fin_requested || slot.local_closed() {
            slot.detached = true;
            // Nobody will read these; hand the credit straight back.
            let dropped = slot.recv_buffered + slot.unreturned;
            slot.recv_buf.clear();
            slot.recv_buffered = 0;
            slot.unreturned = 0;
            if dropped > 0 && !slot.remote_closed() {
                let inc = u32::try_from(dropped).unwrap_or(u32::MAX);
                slot.recv_window = slot.recv_window.saturating_add(inc);
                self.control.push_back(Frame::window_update(id, inc));
            }
            return;
        }
        if let Some(mut slot) = self.streams.remove(&id) {
            slot.retire(&self.metrics);
        }
        self.control
            .push_back(Frame::error(id, ErrorCode::StreamReset, "stream dropped"));
    }

    // ---- handle I/O ----

    pub(crate) fn poll_read(
        &mut self,
        id: u32,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let low_water = self.low_water();
        let Some(slot) = self.streams.get_mut(&id) else {
            return Poll::Ready(Ok(()));
        };

        if !slot.recv_buf.is_empty() {
            let mut copied = 0;
            while buf.remaining() > 0 {
                let Some(chunk) = slot.recv_buf.front_mut() else {
                    break;
                };
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    slot.recv_buf.pop_front();
                }
                copied += n;
            }
            slot.recv_buffered -= copied;
            slot.unreturned += copied;
            if !slot.remote_closed()
                && slot.recv_buffered < low_water
                && slot.unreturned >= low_water
            {
                let inc = u32::try_from(slot.unreturned).unwrap_or(u32::MAX);
                slot.unreturned = 0;
                slot.recv_window = slot.recv_window.saturating_add(inc);
                self.control.push_back(Frame::window_update(id, inc));
            }
            return Poll::Ready(Ok(()));
        }

        if let Some(err) = &slot.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if slot.remote_closed() {
            return Poll::Ready(Ok(()));
        }
        slot.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    pub(crate) fn poll_write(
        &mut self,
        id: u32,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(slot) = self.streams.get_mut(&id) else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed",
            )));
        };
        if let Some(err) = &slot.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if slot.fin_requested || slot.local_closed() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let avail = (slot.send_window as usize).saturating_sub(slot.pending_len);
        if avail == 0 {
            slot.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = avail.min(data.len());
        slot.pending.push_back(Bytes::copy_from_slice(&data[..n]));
        slot.pending_len += n;
        if !slot.queued {
            slot.queued = true;
            self.ready.push_back(id);
        }
        Poll::Ready(Ok(n))
    }

    /// Half-close the local direction. Idempotent.
    pub(crate) fn poll_shutdown(&mut self, id: u32) -> Poll<io::Result<()>> {
        let Some(slot) = self.streams.get_mut(&id) else {
            return Poll::Ready(Ok(()));
        };
        if slot.error.is_some() || slot.fin_requested || slot.local_closed() {
            return Poll::Ready(Ok(()));
        }
        slot.fin_requested = true;
        if !slot.queued {
            slot.queued = true;
            self.ready.push_back(id);
        }
        Poll::Ready(Ok(()))
    }

    // ---- writer side ----

    /// Next frame to put on the wire, or `None` when there is nothing to send.
    pub(crate) fn next_outbound(&mut self) -> Option<Frame> {
        if let Some(frame) = self.control.pop_front() {
            if frame.frame_type == FrameType::OpenStream {
                if let Some(slot) = self.streams.get_mut(&frame.stream_id) {
                    if slot.state == StreamState::Opening {
                        slot.state = StreamState::Open;
                    }
                }
            }
            return Some(frame);
        }
        if self.failure.is_some() {
            return None;
        }

        while let Some(id) = self.ready.pop_front() {
            let Some(slot) = self.streams.get_mut(&id) else {
                continue;
            };
            slot.queued = false;
            if slot.error.is_some() {
                continue;
            }

            if slot.pending_len > 0 && slot.send_window > 0 {
                let limit = self.cfg.max_frame_payload.min(slot.send_window as usize);
                let Some(front) = slot.pending.front_mut() else {
                    continue;
                };
                let chunk = if front.len() <= limit {
                    slot.pending.pop_front().unwrap_or_default()
                } else {
                    front.split_to(limit)
                };
                let n = chunk.len();
                slot.pending_len -= n;
                #[allow(clippy::cast_possible_truncation)]
                {
                    slot.send_window -= n as u32;
                }
                let seq = slot.send_seq;
                slot.send_seq = seq.wrapping_add(1);
                if slot.pending_len > 0 || slot.fin_requested {
                    slot.queued = true;
                    self.ready.push_back(id);
                }
                self.metrics.add_bytes_out(n);
                return Some(Frame::data(id, seq, chunk));
            }

            if slot.pending_len == 0 && slot.fin_requested && !slot.local_closed() {
                slot.state = match slot.state {
                    StreamState::HalfClosedRemote => StreamState::Closed,
                    _ => StreamState::HalfClosedLocal,
                };
                if slot.state == StreamState::Closed {
                    slot.retire(&self.metrics);
                    if slot.detached {
                        self.streams.remove(&id);
                    }
                }
                return Some(Frame::close_stream(id));
            }
        }
        None
    }

    // ---- reader side ----

    /// Apply one inbound frame. An `Err` is fatal to the whole session.
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Result<Inbound, TunnelError> {
        match frame.frame_type {
            FrameType::Hello | FrameType::HelloAck => Err(TunnelError::ProtocolViolation(
                format!("{} after handshake", frame.frame_type.as_str()),
            )),
            FrameType::OpenStream => self.on_open(frame.stream_id),
            FrameType::Data => self.on_data(frame).map(|()| Inbound::Handled),
            FrameType::WindowUpdate => self.on_window_update(&frame).map(|()| Inbound::Handled),
            FrameType::CloseStream => self.on_close(frame.stream_id).map(|()| Inbound::Handled),
            FrameType::Ping => {
                if frame.stream_id != 0 {
                    return Err(TunnelError::ProtocolViolation(
                        "PING on a stream id".into(),
                    ));
                }
                frame.ping_token()?;
                self.control.push_back(Frame::pong(&frame));
                Ok(Inbound::Handled)
            }
            FrameType::Pong => Ok(Inbound::Pong {
                token: frame.ping_token()?,
            }),
            FrameType::Error => {
                let (code, message) = frame.error_parts()?;
                if frame.stream_id == 0 {
                    return Err(TunnelError::from_remote(code, message));
                }
                if let Some(slot) = self.streams.get_mut(&frame.stream_id) {
                    if slot.error.is_none() {
                        let err = if code == ErrorCode::StreamRefused {
                            TunnelError::StreamRefused
                        } else {
                            TunnelError::StreamReset { code, message }
                        };
                        slot.fail(err, &self.metrics);
                    }
                    if slot.detached {
                        self.streams.remove(&frame.stream_id);
                    }
                }
                Ok(Inbound::Handled)
            }
        }
    }

    fn on_open(&mut self, id: u32) -> Result<Inbound, TunnelError> {
        if id == 0 || self.side.owns(id) {
            return Err(TunnelError::ProtocolViolation(format!(
                "peer opened stream {id} with the wrong parity"
            )));
        }
        if id <= self.highest_remote_id {
            return Err(TunnelError::ProtocolViolation(format!(
                "peer reused stream id {id}"
            )));
        }
        self.highest_remote_id = id;

        if self.state != SessionState::Active || self.open_streams() >= self.cfg.max_streams {
            self.control
                .push_back(Frame::error(id, ErrorCode::StreamRefused, "stream refused"));
            return Ok(Inbound::Handled);
        }
        self.streams.insert(id, Slot::new(StreamState::Open, &self.cfg));
        self.metrics.stream_opened();
        Ok(Inbound::Opened(id))
    }

    fn unknown_stream(&self, id: u32, kind: &str) -> Result<(), TunnelError> {
        if self.is_retired(id) {
            Ok(())
        } else {
            Err(TunnelError::ProtocolViolation(format!(
                "{kind} for unknown stream {id}"
            )))
        }
    }

    fn on_data(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let id = frame.stream_id;
        let max = self.cfg.max_frame_payload;
        let Some(slot) = self.streams.get_mut(&id) else {
            return self.unknown_stream(id, "DATA");
        };
        if slot.error.is_some() {
            return Ok(());
        }
        if slot.remote_closed() {
            return Err(TunnelError::ProtocolViolation(format!(
                "DATA after CLOSE_STREAM on stream {id}"
            )));
        }
        if frame.payload.len() > max {
            return Err(TunnelError::ProtocolViolation(format!(
                "DATA of {} bytes exceeds negotiated maximum {max}",
                frame.payload.len()
            )));
        }
        if frame.sequence != slot.recv_seq {
            return Err(TunnelError::Framing(format!(
                "out-of-order DATA on stream {id}: expected {}, got {}",
                slot.recv_seq, frame.sequence
            )));
        }
        let len = frame.payload.len();
        let len32 = u32::try_from(len).unwrap_or(u32::MAX);
        if len32 > slot.recv_window {
            return Err(TunnelError::WindowViolation { stream_id: id });
        }
        slot.recv_seq = slot.recv_seq.wrapping_add(1);
        slot.recv_window -= len32;
        self.metrics.add_bytes_in(len);

        if slot.detached {
            if len > 0 {
                slot.recv_window += len32;
                self.control.push_back(Frame::window_update(id, len32));
            }
            return Ok(());
        }
        if len > 0 {
            slot.recv_buffered += len;
            slot.recv_buf.push_back(frame.payload);
            slot.wake_reader();
        }
        Ok(())
    }

    fn on_window_update(&mut self, frame: &Frame) -> Result<(), TunnelError> {
        let id = frame.stream_id;
        let increment = frame.window_increment()?;
        if increment == 0 {
            return Err(TunnelError::ProtocolViolation(format!(
                "zero WINDOW_UPDATE on stream {id}"
            )));
        }
        let Some(slot) = self.streams.get_mut(&id) else {
            return self.unknown_stream(id, "WINDOW_UPDATE");
        };
        if slot.error.is_some() {
            return Ok(());
        }
        slot.send_window = slot.send_window.checked_add(increment).ok_or_else(|| {
            TunnelError::ProtocolViolation(format!("send window overflow on stream {id}"))
        })?;
        slot.wake_writer();
        if slot.pending_len > 0 && !slot.queued {
            slot.queued = true;
            self.ready.push_back(id);
        }
        Ok(())
    }

    fn on_close(&mut self, id: u32) -> Result<(), TunnelError> {
        let Some(slot) = self.streams.get_mut(&id) else {
            return self.unknown_stream(id, "CLOSE_STREAM");
        };
        if slot.error.is_some() || slot.remote_closed() {
            return Ok(());
        }
        slot.state = match slot.state {
            StreamState::HalfClosedLocal => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
        slot.wake_reader();
        if slot.state == StreamState::Closed {
            slot.retire(&self.metrics);
            if slot.detached {
                self.streams.remove(&id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::task::noop_waker_ref;

    fn cfg(window: u32, max_payload: usize) -> MuxConfig {
        MuxConfig {
            max_frame_payload: max_payload,
            send_window: window,
            recv_window: window,
            max_streams: 4,
        }
    }

    fn mux(side: Side, window: u32, max_payload: usize) -> Mux {
        Mux::new(side, cfg(window, max_payload), Arc::new(TunnelMetrics::new("test")))
    }

    fn cx() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    fn drain(m: &mut Mux) -> Vec<Frame> {
        std::iter::from_fn(|| m.next_outbound()).collect()
    }

    fn read_all(m: &mut Mux, id: u32) -> Vec<u8> {
        let mut out = vec![0u8; 1 << 16];
        let mut buf = ReadBuf::new(&mut out);
        match m.poll_read(id, &mut cx(), &mut buf) {
            Poll::Ready(Ok(())) => buf.filled().to_vec(),
            other => panic!("unexpected poll_read result: {other:?}"),
        }
    }

    #[test]
    fn ids_follow_side_parity() {
        let mut c = mux(Side::Connector, 1024, 1024);
        assert_eq!(c.open_local().unwrap(), 1);
        assert_eq!(c.open_local().unwrap(), 3);
        let mut b = mux(Side::Bridge, 1024, 1024);
        assert_eq!(b.open_local().unwrap(), 2);
        assert_eq!(b.open_local().unwrap(), 4);
    }

    #[test]
    fn writes_never_exceed_send_window() {
        let mut m = mux(Side::Connector, 10, 4);
        let id = m.open_local().unwrap();

        let data = [7u8; 25];
        assert!(matches!(m.poll_write(id, &mut cx(), &data), Poll::Ready(Ok(10))));
        assert!(m.poll_write(id, &mut cx(), &data).is_pending());

        let frames = drain(&mut m);
        let kinds: Vec<_> = frames.iter().map(|f| (f.frame_type, f.payload.len())).collect();
        assert_eq!(
            kinds,
            vec![
                (FrameType::OpenStream, 0),
                (FrameType::Data, 4),
                (FrameType::Data, 4),
                (FrameType::Data, 2),
            ]
        );
        let seqs: Vec<_> = frames[1..].iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        m.on_frame(Frame::window_update(id, 6)).unwrap();
        assert!(matches!(m.poll_write(id, &mut cx(), &data), Poll::Ready(Ok(6))));
    }

    #[test]
    fn control_frames_jump_ahead_of_data() {
        let mut m = mux(Side::Connector, 1024, 16);
        let id = m.open_local().unwrap();
        let _ = drain(&mut m);
        assert!(m.poll_write(id, &mut cx(), &[1u8; 64]).is_ready());
        let first = m.next_outbound().unwrap();
        assert_eq!(first.frame_type, FrameType::Data);
        m.on_frame(Frame::ping(9, 42)).unwrap();
        let next = m.next_outbound().unwrap();
        assert_eq!(next.frame_type, FrameType::Pong);
        assert_eq!(next.ping_token().unwrap(), 42);
    }

    #[test]
    fn streams_are_served_round_robin() {
        let mut m = mux(Side::Bridge, 1024, 8);
        let a = m.open_local().unwrap();
        let b = m.open_local().unwrap();
        let _ = drain(&mut m);
        assert!(m.poll_write(a, &mut cx(), &[0u8; 24]).is_ready());
        assert!(m.poll_write(b, &mut cx(), &[1u8; 24]).is_ready());
        let order: Vec<u32> = drain(&mut m).iter().map(|f| f.stream_id).collect();
        assert_eq!(order, vec![a, b, a, b, a, b]);
    }

    #[test]
    fn receive_window_violation_is_fatal() {
        let mut m = mux(Side::Bridge, 8, 64);
        assert_eq!(m.on_frame(Frame::open_stream(1)).unwrap(), Inbound::Opened(1));
        m.on_frame(Frame::data(1, 0, Bytes::from_static(b"12345678")))
            .unwrap();
        let err = m
            .on_frame(Frame::data(1, 1, Bytes::from_static(b"9")))
            .unwrap_err();
        assert_eq!(err, TunnelError::WindowViolation { stream_id: 1 });
    }

    #[test]
    fn sequence_gap_is_a_framing_error() {
        let mut m = mux(Side::Bridge, 64, 64);
        m.on_frame(Frame::open_stream(1)).unwrap();
        let err = m
            .on_frame(Frame::data(1, 1, Bytes::from_static(b"x")))
            .unwrap_err();
        assert!(matches!(err, TunnelError::Framing(_)));
    }

    #[test]
    fn reading_returns_credit_past_low_water() {
        let mut m = mux(Side::Bridge, 16, 16);
        m.on_frame(Frame::open_stream(1)).unwrap();
        m.on_frame(Frame::data(1, 0, Bytes::from_static(b"0123456789abcdef")))
            .unwrap();
        assert_eq!(read_all(&mut m, 1), b"0123456789abcdef");

        let update = m.next_outbound().unwrap();
        assert_eq!(update.frame_type, FrameType::WindowUpdate);
        assert_eq!(update.window_increment().unwrap(), 16);
        // Credit restored: a full window is accepted again.
        m.on_frame(Frame::data(1, 1, Bytes::from_static(b"0123456789abcdef")))
            .unwrap();
    }

    #[test]
    fn wrong_parity_and_reused_ids_are_violations() {
        let mut m = mux(Side::Bridge, 64, 64);
        assert!(matches!(
            m.on_frame(Frame::open_stream(2)),
            Err(TunnelError::ProtocolViolation(_))
        ));
        m.on_frame(Frame::open_stream(5)).unwrap();
        assert!(matches!(
            m.on_frame(Frame::open_stream(3)),
            Err(TunnelError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn data_for_unknown_and_retired_streams() {
        let mut m = mux(Side::Bridge, 64, 64);
        assert!(matches!(
            m.on_frame(Frame::data(7, 0, Bytes::from_static(b"x"))),
            Err(TunnelError::ProtocolViolation(_))
        ));

        m.on_frame(Frame::open_stream(1)).unwrap();
        m.on_frame(Frame::close_stream(1)).unwrap();
        assert!(m.poll_shutdown(1).is_ready());
        let _ = drain(&mut m);
        m.release(1);
        assert_eq!(m.stream_state(1), StreamState::Closed);
        // Late frame after the stream was fully retired is ignored.
        assert_eq!(
            m.on_frame(Frame::window_update(1, 10)).unwrap(),
            Inbound::Handled
        );
    }

    #[test]
    fn half_close_transitions() {
        let mut m = mux(Side::Connector, 64, 64);
        let id = m.open_local().unwrap();
        assert_eq!(m.stream_state(id), StreamState::Opening);
        let _ = drain(&mut m);
        assert_eq!(m.stream_state(id), StreamState::Open);

        m.on_frame(Frame::close_stream(id)).unwrap();
        assert_eq!(m.stream_state(id), StreamState::HalfClosedRemote);
        assert!(read_all(&mut m, id).is_empty());

        assert!(m.poll_write(id, &mut cx(), b"bye").is_ready());
        assert!(m.poll_shutdown(id).is_ready());
        let frames = drain(&mut m);
        assert_eq!(frames[0].frame_type, FrameType::Data);
        assert_eq!(frames[1].frame_type, FrameType::CloseStream);
        assert_eq!(m.stream_state(id), StreamState::Closed);
        assert_eq!(m.open_streams(), 0);
    }

    #[test]
    fn dropping_an_open_handle_resets_the_stream() {
        let mut m = mux(Side::Connector, 64, 64);
        let id = m.open_local().unwrap();
        let _ = drain(&mut m);
        m.release(id);
        let frame = m.next_outbound().unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(frame.error_parts().unwrap().0, ErrorCode::StreamReset);
        assert_eq!(m.open_streams(), 0);
    }

    #[test]
    fn dropping_after_shutdown_still_flushes() {
        let mut m = mux(Side::Connector, 64, 64);
        let id = m.open_local().unwrap();
        assert!(m.poll_write(id, &mut cx(), b"tail").is_ready());
        assert!(m.poll_shutdown(id).is_ready());
        m.release(id);
        let kinds: Vec<_> = drain(&mut m).iter().map(|f| f.frame_type).collect();
        assert_eq!(
            kinds,
            vec![FrameType::OpenStream, FrameType::Data, FrameType::CloseStream]
        );
        m.on_frame(Frame::close_stream(id)).unwrap();
        assert_eq!(m.open_streams(), 0);
    }

    #[test]
    fn session_failure_reaches_every_stream() {
        let mut m = mux(Side::Bridge, 64, 64);
        let id = m.open_local().unwrap();
        assert!(m.fail_all(&TunnelError::SessionSuperseded));
        assert!(!m.fail_all(&TunnelError::KeepaliveTimeout));

        let mut out = [0u8; 8];
        let mut buf = ReadBuf::new(&mut out);
        match m.poll_read(id, &mut cx(), &mut buf) {
            Poll::Ready(Err(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted),
            other => panic!("expected error, got {other:?}"),
        }
        let frames = drain(&mut m);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, 0);
        assert_eq!(
            frames[0].error_parts().unwrap().0,
            ErrorCode::SessionSuperseded
        );
        assert!(matches!(m.open_local(), Err(TunnelError::SessionSuperseded)));
    }

    #[test]
    fn stream_limit_refuses_peer_opens() {
        let mut m = mux(Side::Bridge, 64, 64);
        for id in [1, 3, 5, 7] {
            assert_eq!(m.on_frame(Frame::open_stream(id)).unwrap(), Inbound::Opened(id));
        }
        assert_eq!(m.on_frame(Frame::open_stream(9)).unwrap(), Inbound::Handled);
        let refusal = m.next_outbound().unwrap();
        assert_eq!(refusal.stream_id, 9);
        assert_eq!(refusal.error_parts().unwrap().0, ErrorCode::StreamRefused);
    }

    #[test]
    fn draining_refuses_new_streams() {
        let mut m = mux(Side::Connector, 64, 64);
        assert!(m.begin_drain());
        assert!(matches!(m.open_local(), Err(TunnelError::GoingAway)));
        assert_eq!(m.on_frame(Frame::open_stream(2)).unwrap(), Inbound::Handled);
    }

    #[test]
    fn peer_stream_error_is_scoped() {
        let mut m = mux(Side::Connector, 64, 64);
        let a = m.open_local().unwrap();
        let b = m.open_local().unwrap();
        m.on_frame(Frame::error(a, ErrorCode::StreamRefused, "busy"))
            .unwrap();
        assert!(matches!(
            m.poll_write(a, &mut cx(), b"x"),
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset
        ));
        assert!(matches!(m.poll_write(b, &mut cx(), b"x"), Poll::Ready(Ok(1))));
    }

    #[test]
    fn session_error_frame_is_fatal() {
        let mut m = mux(Side::Connector, 64, 64);
        let err = m
            .on_frame(Frame::error(0, ErrorCode::SessionSuperseded, "replaced"))
            .unwrap_err();
        assert_eq!(err, TunnelError::SessionSuperseded);
    }
}

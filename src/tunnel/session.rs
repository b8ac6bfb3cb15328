//! One authenticated transport carrying many streams.
//!
//! A session owns three tasks:
//!
//! - **reader**: decodes frames and applies them to the [`Mux`]
//! - **writer**: drains [`Mux::next_outbound`] onto the transport
//! - **keepalive**: sends PINGs and kills the session when PONGs stop
//!
//! Any fatal error goes through [`Session::terminate`], which stops the
//! keepalive, fails every stream, queues a best-effort `ERROR` frame and then
//! tells the writer to flush it and close the transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::frame::FrameCodec;
use super::handshake::Negotiated;
use super::mux::{Inbound, Mux, MuxConfig, SessionState, Side};
use super::stream::StreamHandle;
use crate::error::TunnelError;
use crate::metrics::TunnelMetrics;
use crate::state::TunnelStats;

/// How long the writer may spend flushing the final frames on teardown.
const TEARDOWN_FLUSH: Duration = Duration::from_secs(2);
/// Poll interval while a draining session waits for its streams.
const DRAIN_POLL: Duration = Duration::from_millis(50);
const NO_RTT: u64 = u64::MAX;

/// Per-session tunables that are not negotiated.
#[derive(Clone)]
pub struct SessionParams {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub max_streams: usize,
    /// Peer-opened streams waiting for [`Incoming::accept`] before new ones
    /// are refused.
    pub accept_backlog: usize,
    /// Connection history and RTT samples, when the caller tracks them.
    pub stats: Option<Arc<TunnelStats>>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(90),
            max_streams: 256,
            accept_backlog: 64,
            stats: None,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) id: Uuid,
    side: Side,
    identity: String,
    customer_hash: String,
    created_at: SystemTime,
    epoch: Instant,
    last_activity_ms: AtomicU64,
    last_pong_ms: AtomicU64,
    rtt_ms: AtomicU64,
    mux: Mutex<Mux>,
    writer_wake: Notify,
    cancel: CancellationToken,
    keepalive_cancel: CancellationToken,
    end: watch::Sender<Option<TunnelError>>,
    metrics: Arc<TunnelMetrics>,
}

impl Shared {
    pub(crate) fn mux(&self) -> MutexGuard<'_, Mux> {
        self.mux.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_writer(&self) {
        self.writer_wake.notify_one();
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Returns the round trip implied by the echoed token.
    fn record_pong(&self, token: u64) -> u64 {
        let now = self.elapsed_ms();
        self.last_pong_ms.store(now, Ordering::Relaxed);
        let rtt = now.saturating_sub(token);
        self.rtt_ms.store(rtt, Ordering::Relaxed);
        rtt
    }

    fn terminate(&self, err: TunnelError) {
        self.keepalive_cancel.cancel();
        let first = self.mux().fail_all(&err);
        if first {
            match &err {
                TunnelError::TransportClosed | TunnelError::GoingAway => {
                    info!(reason = %err, "Session ending");
                }
                _ => warn!(reason = %err, "Session failed"),
            }
        }
        self.wake_writer();
        self.cancel.cancel();
    }

    /// Called once by the writer after the transport is closed.
    fn finish(&self) {
        let reason = {
            let mut mux = self.mux();
            mux.mark_closed();
            mux.failure().cloned().unwrap_or(TunnelError::TransportClosed)
        };
        self.metrics.session_closed();
        self.end.send_replace(Some(reason));
        debug!("Session closed");
    }
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// Streams opened by the peer, in arrival order.
pub struct Incoming {
    rx: mpsc::Receiver<StreamHandle>,
}

impl Incoming {
    /// Next peer-opened stream, or `None` once the session is gone.
    pub async fn accept(&mut self) -> Option<StreamHandle> {
        self.rx.recv().await
    }
}

impl Session {
    /// Take over an authenticated transport and start the session tasks.
    pub fn spawn<T>(
        framed: Framed<T, FrameCodec>,
        side: Side,
        negotiated: Negotiated,
        identity: String,
        params: SessionParams,
        metrics: Arc<TunnelMetrics>,
    ) -> (Session, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cfg = MuxConfig {
            max_frame_payload: negotiated.max_frame_payload as usize,
            send_window: negotiated.send_window,
            recv_window: negotiated.recv_window,
            max_streams: params.max_streams,
        };
        let cancel = CancellationToken::new();
        let (end, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id: negotiated.session_id,
            side,
            customer_hash: crate::auth::customer_hash(&identity),
            identity,
            created_at: SystemTime::now(),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(0),
            rtt_ms: AtomicU64::new(NO_RTT),
            mux: Mutex::new(Mux::new(side, cfg, metrics.clone())),
            writer_wake: Notify::new(),
            keepalive_cancel: cancel.child_token(),
            cancel,
            end,
            metrics: metrics.clone(),
        });
        metrics.session_opened();

        let span = tracing::info_span!(
            "session",
            session_id = %shared.id,
            side = side.as_str(),
            customer = %shared.customer_hash,
        );

        let parts = framed.into_parts();
        let (rd, wr) = tokio::io::split(parts.io);
        let mut reader = FramedRead::new(rd, FrameCodec::new());
        // Bytes that arrived right behind the handshake belong to the session.
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
        let writer = FramedWrite::new(wr, FrameCodec::new());

        let (incoming_tx, incoming_rx) = mpsc::channel(params.accept_backlog.max(1));

        tokio::spawn(
            read_loop(shared.clone(), reader, incoming_tx, params.stats.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(write_loop(shared.clone(), writer).instrument(span.clone()));
        tokio::spawn(
            keepalive_loop(
                shared.clone(),
                params.keepalive_interval,
                params.keepalive_timeout,
            )
            .instrument(span),
        );

        (Session { shared }, Incoming { rx: incoming_rx })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn side(&self) -> Side {
        self.shared.side
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn customer_hash(&self) -> &str {
        &self.shared.customer_hash
    }

    pub fn created_at(&self) -> SystemTime {
        self.shared.created_at
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let last = self.shared.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.shared.elapsed_ms().saturating_sub(last))
    }

    /// Last measured PING round trip.
    pub fn rtt(&self) -> Option<Duration> {
        match self.shared.rtt_ms.load(Ordering::Relaxed) {
            NO_RTT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.mux().state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn open_streams(&self) -> usize {
        self.shared.mux().open_streams()
    }

    /// Open a new stream toward the peer. The OPEN frame goes out ahead of
    /// any data written to the returned handle.
    pub fn open_stream(&self) -> Result<StreamHandle, TunnelError> {
        let id = self.shared.mux().open_local()?;
        self.shared.wake_writer();
        Ok(StreamHandle::new(id, self.shared.clone()))
    }

    /// Tear the session down with `err`. Safe to call more than once; only the
    /// first reason is kept.
    pub fn terminate(&self, err: TunnelError) {
        self.shared.terminate(err);
    }

    /// Stop admitting streams, give open ones up to `grace` to finish, then
    /// close with `GOING_AWAY`.
    pub async fn drain(&self, grace: Duration) {
        if self.shared.mux().begin_drain() {
            info!(session_id = %self.id(), "Draining session");
        }
        let _ = tokio::time::timeout(grace, async {
            while self.open_streams() > 0 && !self.shared.cancel.is_cancelled() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        self.terminate(TunnelError::GoingAway);
        self.closed().await;
    }

    /// Resolves with the reason once the session has fully closed.
    pub async fn closed(&self) -> TunnelError {
        let mut rx = self.shared.end.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return TunnelError::TransportClosed;
            }
        }
    }

    /// Reason the session ended, if it has.
    pub fn end_reason(&self) -> Option<TunnelError> {
        self.shared.end.borrow().clone()
    }

    /// Whether both handles refer to the same session.
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("side", &self.shared.side)
            .field("customer_hash", &self.shared.customer_hash)
            .finish_non_exhaustive()
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut reader: FramedRead<ReadHalf<R>, FrameCodec>,
    incoming: mpsc::Sender<StreamHandle>,
    stats: Option<Arc<TunnelStats>>,
) where
    R: AsyncRead + AsyncWrite,
{
    loop {
        let next = tokio::select! {
            () = shared.cancel.cancelled() => return,
            next = reader.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                shared.terminate(e);
                return;
            }
            None => {
                shared.terminate(TunnelError::TransportClosed);
                return;
            }
        };
        shared.touch();

        let outcome = shared.mux().on_frame(frame);
        match outcome {
            Ok(Inbound::Handled) => {}
            Ok(Inbound::Opened(id)) => {
                let handle = StreamHandle::new(id, shared.clone());
                if let Err(e) = incoming.try_send(handle) {
                    debug!(stream_id = id, "No acceptor for stream, refusing");
                    e.into_inner().refuse();
                }
            }
            Ok(Inbound::Pong { token }) => {
                let rtt = shared.record_pong(token);
                if let Some(stats) = &stats {
                    stats.record_rtt(rtt).await;
                }
            }
            Err(e) => {
                shared.terminate(e);
                return;
            }
        }
        shared.wake_writer();
    }
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: FramedWrite<WriteHalf<W>, FrameCodec>)
where
    W: AsyncRead + AsyncWrite,
{
    loop {
        // Wait for buffer room before popping, so a frame taken off the mux is
        // always handed to the codec and never dropped by cancellation.
        let ready = tokio::select! {
            () = shared.cancel.cancelled() => break,
            ready = futures_util::future::poll_fn(|cx| writer.poll_ready_unpin(cx)) => ready,
        };
        if let Err(e) = ready {
            shared.terminate(e);
            break;
        }
        let next = shared.mux().next_outbound();
        if let Some(frame) = next {
            if let Err(e) = writer.start_send_unpin(frame) {
                shared.terminate(e);
                break;
            }
            continue;
        }

        let flushed = tokio::select! {
            () = shared.cancel.cancelled() => break,
            flushed = writer.flush() => flushed,
        };
        if let Err(e) = flushed {
            shared.terminate(e);
            break;
        }
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            () = shared.writer_wake.notified() => {}
        }
    }

    // Whatever is still queued now is the control tail (the ERROR frame).
    let tail: Vec<_> = {
        let mut mux = shared.mux();
        std::iter::from_fn(|| mux.next_outbound()).collect()
    };
    let _ = tokio::time::timeout(TEARDOWN_FLUSH, async {
        for frame in tail {
            writer.feed(frame).await?;
        }
        writer.close().await
    })
    .await;
    shared.finish();
}

async fn keepalive_loop(shared: Arc<Shared>, interval: Duration, timeout: Duration) {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq: u32 = 0;
    loop {
        tokio::select! {
            () = shared.keepalive_cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let silent_for = shared
            .elapsed_ms()
            .saturating_sub(shared.last_pong_ms.load(Ordering::Relaxed));
        if silent_for >= timeout_ms {
            warn!(silent_ms = silent_for, "No PONG within keepalive timeout");
            shared.terminate(TunnelError::KeepaliveTimeout);
            return;
        }
        seq = seq.wrapping_add(1);
        shared.mux().queue_ping(seq, shared.elapsed_ms());
        shared.wake_writer();
    }
}

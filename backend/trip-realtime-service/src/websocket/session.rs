//! `SafeConn`: one upgraded WebSocket connection.
//!
//! Each session runs a write pump, a read pump and a backpressure monitor on
//! the local actix runtime. The transport sink sits behind the session's write
//! mutex; `close` takes it out under that mutex and closes the captured value,
//! so a pump never observes a sink that is being torn down.

use actix_middleware::WsConnectionPermit;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::config::SessionConfig;
use super::metrics::SessionMetrics;
use super::transport::{
    Frame, FrameSink, FrameSource, OutFrame, TransportError, CLOSE_GOING_AWAY,
    CLOSE_INTERNAL_ERROR, CLOSE_MESSAGE_TOO_BIG, CLOSE_NORMAL, CLOSE_NO_STATUS,
    CLOSE_POLICY_VIOLATION,
};
use crate::error::SessionError;

const BUFFER_NORMAL: u8 = 0;
const BUFFER_BACKPRESSURED: u8 = 1;

/// Why a session ended. Used for the close frame and the close metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    ClientClosed,
    Timeout,
    Backpressure,
    MessageTooLarge,
    WriteFailed,
    ReadFailed,
    Panic,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Timeout => "timeout",
            CloseReason::Backpressure => "backpressure",
            CloseReason::MessageTooLarge => "message_too_large",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::ReadFailed => "read_failed",
            CloseReason::Panic => "panic",
            CloseReason::Shutdown => "shutdown",
        }
    }

    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::Normal | CloseReason::ClientClosed => CLOSE_NORMAL,
            CloseReason::Timeout | CloseReason::Shutdown => CLOSE_GOING_AWAY,
            CloseReason::Backpressure => CLOSE_POLICY_VIOLATION,
            CloseReason::MessageTooLarge => CLOSE_MESSAGE_TOO_BIG,
            CloseReason::WriteFailed | CloseReason::ReadFailed | CloseReason::Panic => {
                CLOSE_INTERNAL_ERROR
            }
        }
    }
}

struct Shared {
    id: Uuid,
    user_id: String,
    trip_id: String,
    config: SessionConfig,
    metrics: SessionMetrics,
    closed: AtomicBool,
    buffer_status: AtomicU8,
    outbound_tx: mpsc::Sender<String>,
    /// Outbound receiver until `start` hands it to the write pump.
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    done: watch::Sender<bool>,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    permit: Mutex<Option<WsConnectionPermit>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.metrics.active_connections.dec();
        }
    }
}

/// Cloneable handle to one session.
#[derive(Clone)]
pub struct SafeConn {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SafeConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeConn")
            .field("id", &self.shared.id)
            .field("user_id", &self.shared.user_id)
            .field("trip_id", &self.shared.trip_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SafeConn {
    /// Counts as an active connection from construction until `close`.
    pub fn new(
        user_id: impl Into<String>,
        trip_id: impl Into<String>,
        config: SessionConfig,
        metrics: SessionMetrics,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.buffer_size);
        let (done, _) = watch::channel(false);
        metrics.active_connections.inc();

        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                user_id: user_id.into(),
                trip_id: trip_id.into(),
                config,
                metrics,
                closed: AtomicBool::new(false),
                buffer_status: AtomicU8::new(BUFFER_NORMAL),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                done,
                sink: tokio::sync::Mutex::new(None),
                permit: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn trip_id(&self) -> &str {
        &self.shared.trip_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn is_backpressured(&self) -> bool {
        self.shared.buffer_status.load(Ordering::Acquire) == BUFFER_BACKPRESSURED
    }

    /// Frames waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.shared.config.buffer_size - self.shared.outbound_tx.capacity()
    }

    /// Resolves once `close` has run.
    pub async fn closed(&self) {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|closed| *closed).await;
    }

    /// Released when the session closes.
    pub fn attach_permit(&self, permit: WsConnectionPermit) {
        *self
            .shared
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(permit);
    }

    /// Non-blocking enqueue of an outbound text frame.
    pub fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.is_backpressured() {
            self.shared.metrics.messages_dropped.inc();
            return Err(SessionError::Backpressure);
        }

        match self.shared.outbound_tx.try_send(text.into()) {
            Ok(()) => {
                self.refresh_buffer_status();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.metrics.messages_dropped.inc();
                self.set_backpressured(true);
                Err(SessionError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    fn set_backpressured(&self, on: bool) {
        let (from, to) = if on {
            (BUFFER_NORMAL, BUFFER_BACKPRESSURED)
        } else {
            (BUFFER_BACKPRESSURED, BUFFER_NORMAL)
        };
        let flipped = self
            .shared
            .buffer_status
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            if on {
                self.shared.metrics.backpressure_events.inc();
            }
            tracing::debug!(
                session_id = %self.shared.id,
                user_id = %self.shared.user_id,
                queued = self.queued(),
                backpressured = on,
                "WebSocket buffer status changed"
            );
        }
    }

    /// Hysteresis between the high and low water marks.
    fn refresh_buffer_status(&self) {
        let queued = self.queued();
        if queued > self.shared.config.buffer_high_water {
            self.set_backpressured(true);
        } else if queued <= self.shared.config.buffer_low_water {
            self.set_backpressured(false);
        }
    }

    /// Hands the transport to the session and spawns its pumps.
    ///
    /// Returns the inbound queue; it yields client text frames in receive order
    /// and ends when the read pump stops.
    pub fn start<S>(
        &self,
        sink: Box<dyn FrameSink>,
        source: S,
    ) -> Result<mpsc::Receiver<String>, SessionError>
    where
        S: FrameSource + 'static,
    {
        let outbound_rx = self
            .shared
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::Closed)?;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        match self.shared.sink.try_lock() {
            Ok(mut slot) => *slot = Some(sink),
            Err(_) => return Err(SessionError::Closed),
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.shared.config.buffer_size);

        spawn_guarded(self.clone(), "write_pump", write_pump(self.clone(), outbound_rx));
        spawn_guarded(
            self.clone(),
            "read_pump",
            read_pump(self.clone(), source, inbound_tx),
        );
        spawn_guarded(self.clone(), "buffer_monitor", buffer_monitor(self.clone()));

        tracing::info!(
            session_id = %self.shared.id,
            user_id = %self.shared.user_id,
            trip_id = %self.shared.trip_id,
            "WebSocket session started"
        );
        Ok(inbound_rx)
    }

    /// Writes one frame under the write mutex with the `write_wait` deadline.
    async fn write(&self, frame: OutFrame) -> Result<(), SessionError> {
        let mut slot = self.shared.sink.lock().await;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let sink = slot.as_mut().ok_or(SessionError::Closed)?;
        match tokio::time::timeout(self.shared.config.write_wait, sink.send(frame)).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::WriteTimeout),
        }
    }

    /// Idempotent. Only the first call decrements the active gauge, signals the
    /// pumps and closes the transport; later calls return `false`.
    pub async fn close(&self, reason: CloseReason) -> bool {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.shared.metrics.active_connections.dec();
        self.shared
            .metrics
            .sessions_closed
            .with_label_values(&[reason.as_str()])
            .inc();
        self.shared.done.send_replace(true);

        let sink = self.shared.sink.lock().await.take();
        if let Some(sink) = sink {
            sink.close(reason.close_code(), reason.as_str()).await;
        }

        // Never started: nobody else owns the outbound queue.
        let pending = self
            .shared
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut outbound) = pending {
            drain(&mut outbound);
        }

        let permit = self
            .shared
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(permit) = permit {
            permit.release().await;
        }

        tracing::info!(
            session_id = %self.shared.id,
            user_id = %self.shared.user_id,
            trip_id = %self.shared.trip_id,
            reason = reason.as_str(),
            "WebSocket session closed"
        );
        true
    }
}

fn drain(queue: &mut mpsc::Receiver<String>) {
    queue.close();
    while queue.try_recv().is_ok() {}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs a session task on the local runtime. A panic is logged and turned into
/// a session close; it never reaches other sessions.
pub(crate) fn spawn_guarded<F>(conn: SafeConn, task: &'static str, fut: F)
where
    F: Future<Output = CloseReason> + 'static,
{
    actix_rt::spawn(async move {
        let reason = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(reason) => reason,
            Err(payload) => {
                tracing::error!(
                    task,
                    session_id = %conn.shared.id,
                    user_id = %conn.shared.user_id,
                    trip_id = %conn.shared.trip_id,
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "WebSocket session task panicked"
                );
                CloseReason::Panic
            }
        };
        conn.close(reason).await;
    });
}

async fn write_pump(conn: SafeConn, mut outbound: mpsc::Receiver<String>) -> CloseReason {
    let mut done = conn.shared.done.subscribe();
    let period = conn.shared.config.ping_period;
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;
            _ = done.wait_for(|closed| *closed) => break CloseReason::Normal,
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    break CloseReason::Normal;
                };
                if let Err(e) = conn.write(OutFrame::Text(text)).await {
                    break write_failure(&conn, e);
                }
                conn.refresh_buffer_status();
            }
            _ = ping.tick() => {
                if let Err(e) = conn.write(OutFrame::Ping).await {
                    break write_failure(&conn, e);
                }
                tracing::trace!(session_id = %conn.shared.id, "WebSocket ping sent");
            }
        }
    };

    drain(&mut outbound);
    reason
}

fn write_failure(conn: &SafeConn, e: SessionError) -> CloseReason {
    if e == SessionError::Closed {
        return CloseReason::Normal;
    }
    tracing::warn!(
        session_id = %conn.shared.id,
        user_id = %conn.shared.user_id,
        error = %e,
        "WebSocket write failed"
    );
    CloseReason::WriteFailed
}

async fn read_pump<S: FrameSource>(
    conn: SafeConn,
    mut source: S,
    inbound: mpsc::Sender<String>,
) -> CloseReason {
    let mut done = conn.shared.done.subscribe();
    let pong_wait = conn.shared.config.pong_wait;
    let max_message_size = conn.shared.config.max_message_size;
    let deadline = tokio::time::sleep(pong_wait);
    tokio::pin!(deadline);

    loop {
        let next = tokio::select! {
            biased;
            _ = done.wait_for(|closed| *closed) => return CloseReason::Normal,
            _ = &mut deadline => {
                tracing::info!(
                    session_id = %conn.shared.id,
                    user_id = %conn.shared.user_id,
                    "WebSocket read deadline expired"
                );
                return CloseReason::Timeout;
            }
            frame = source.recv() => frame,
        };

        let frame = match next {
            None => return CloseReason::ClientClosed,
            Some(Ok(frame)) => frame,
            Some(Err(TransportError::Overflow)) => return CloseReason::MessageTooLarge,
            Some(Err(e)) => {
                tracing::warn!(
                    session_id = %conn.shared.id,
                    user_id = %conn.shared.user_id,
                    error = %e,
                    "WebSocket read failed"
                );
                return CloseReason::ReadFailed;
            }
        };

        let text = match frame {
            Frame::Pong => {
                deadline.as_mut().reset(Instant::now() + pong_wait);
                continue;
            }
            Frame::Ping(payload) => {
                if let Err(e) = conn.write(OutFrame::Pong(payload)).await {
                    return write_failure(&conn, e);
                }
                continue;
            }
            Frame::Close(code) => {
                match code {
                    None | Some(CLOSE_NORMAL | CLOSE_GOING_AWAY | CLOSE_NO_STATUS) => {}
                    Some(code) => tracing::warn!(
                        session_id = %conn.shared.id,
                        user_id = %conn.shared.user_id,
                        code,
                        "WebSocket closed unexpectedly"
                    ),
                }
                return CloseReason::ClientClosed;
            }
            Frame::Text(text) => text,
            Frame::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::debug!(session_id = %conn.shared.id, "Ignoring non UTF-8 binary frame");
                    continue;
                }
            },
        };

        if text.len() > max_message_size {
            tracing::warn!(
                session_id = %conn.shared.id,
                user_id = %conn.shared.user_id,
                size = text.len(),
                max_message_size,
                "WebSocket message too large"
            );
            return CloseReason::MessageTooLarge;
        }

        match inbound.try_send(text) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id = %conn.shared.id,
                    user_id = %conn.shared.user_id,
                    "WebSocket inbound queue full, closing session"
                );
                return CloseReason::Backpressure;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return CloseReason::Normal,
        }
    }
}

async fn buffer_monitor(conn: SafeConn) -> CloseReason {
    let mut done = conn.shared.done.subscribe();
    let mut tick = tokio::time::interval(conn.shared.config.monitor_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = done.wait_for(|closed| *closed) => return CloseReason::Normal,
            _ = tick.tick() => conn.refresh_buffer_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::transport::fake::{ChannelSink, ChannelSource, Written};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn metrics() -> SessionMetrics {
        SessionMetrics::new().unwrap()
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            write_wait: Duration::from_millis(200),
            pong_wait: Duration::from_secs(5),
            ping_period: Duration::from_secs(1),
            max_message_size: 64,
            buffer_size: 4,
            buffer_high_water: 4,
            buffer_low_water: 1,
            monitor_interval: Duration::from_millis(10),
        }
    }

    async fn next_written(rx: &mut mpsc::UnboundedReceiver<Written>) -> Written {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("sink dropped")
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<Written>) -> String {
        loop {
            match next_written(rx).await {
                Written::Frame(OutFrame::Text(text)) => return text,
                Written::Frame(_) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[actix_rt::test]
    async fn test_first_frame_and_ping() {
        let metrics = metrics();
        let config = SessionConfig {
            ping_period: Duration::from_millis(100),
            ..small_config()
        };
        let conn = SafeConn::new("U1", "T1", config, metrics.clone());
        assert_eq!(metrics.active_connections.get(), 1);

        conn.send("connected").unwrap();
        let (sink, mut written) = ChannelSink::new();
        let (source, _frames) = ChannelSource::new();
        conn.start(Box::new(sink), source).unwrap();

        assert_eq!(
            next_written(&mut written).await,
            Written::Frame(OutFrame::Text("connected".into()))
        );
        assert_eq!(next_written(&mut written).await, Written::Frame(OutFrame::Ping));
        assert_eq!(conn.user_id(), "U1");
        assert_eq!(conn.trip_id(), "T1");

        conn.close(CloseReason::Normal).await;
    }

    #[actix_rt::test]
    async fn test_frames_are_written_in_send_order() {
        let conn = SafeConn::new("U1", "T1", SessionConfig::default(), metrics());
        let (sink, mut written) = ChannelSink::new();
        let (source, _frames) = ChannelSource::new();
        conn.start(Box::new(sink), source).unwrap();

        for i in 0..20 {
            conn.send(format!("m{i}")).unwrap();
        }
        for i in 0..20 {
            assert_eq!(next_text(&mut written).await, format!("m{i}"));
        }
        conn.close(CloseReason::Normal).await;
    }

    #[actix_rt::test]
    async fn test_backpressure_starts_above_high_water() {
        let config = SessionConfig {
            buffer_size: 8,
            ..small_config()
        };
        let conn = SafeConn::new("U1", "T1", config, metrics());

        for i in 0..4 {
            conn.send(format!("m{i}")).unwrap();
        }
        assert!(!conn.is_backpressured());

        conn.send("m4").unwrap();
        assert!(conn.is_backpressured());
        assert_eq!(conn.send("m5"), Err(SessionError::Backpressure));
        conn.close(CloseReason::Normal).await;
    }

    #[actix_rt::test]
    async fn test_backpressure_trips_and_recovers() {
        let metrics = metrics();
        let conn = SafeConn::new("U1", "T1", small_config(), metrics.clone());

        let results: Vec<_> = (0..8).map(|i| conn.send(format!("m{i}"))).collect();
        assert!(results[..4].iter().all(Result::is_ok));
        assert!(results[4..]
            .iter()
            .all(|r| *r == Err(SessionError::Backpressure)));
        assert!(conn.is_backpressured());
        assert_eq!(metrics.messages_dropped.get(), 4);
        assert_eq!(metrics.backpressure_events.get(), 1);

        let gate = Arc::new(Semaphore::new(0));
        let (sink, mut written) = ChannelSink::gated(gate.clone());
        let (source, _frames) = ChannelSource::new();
        conn.start(Box::new(sink), source).unwrap();

        gate.add_permits(4);
        for i in 0..4 {
            assert_eq!(next_text(&mut written).await, format!("m{i}"));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while conn.is_backpressured() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("buffer status never recovered");
        assert!(conn.send("after").is_ok());

        gate.add_permits(100);
        conn.close(CloseReason::Normal).await;
    }

    #[actix_rt::test]
    async fn test_close_is_idempotent() {
        let metrics = metrics();
        let conn = SafeConn::new("U1", "T1", small_config(), metrics.clone());
        let (sink, mut written) = ChannelSink::new();
        let (source, _frames) = ChannelSource::new();
        conn.start(Box::new(sink), source).unwrap();

        let results = futures::future::join_all(
            (0..5).map(|_| conn.close(CloseReason::Normal)),
        )
        .await;
        assert_eq!(results.iter().filter(|closed| **closed).count(), 1);
        assert!(!conn.close(CloseReason::Timeout).await);

        assert_eq!(metrics.active_connections.get(), 0);
        assert_eq!(metrics.closed_with("normal"), 1);
        assert_eq!(metrics.closed_with("timeout"), 0);
        assert_eq!(conn.send("late"), Err(SessionError::Closed));

        let mut closes = 0;
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(100), written.recv()).await
        {
            if let Written::Closed(code) = frame {
                assert_eq!(code, CLOSE_NORMAL);
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[actix_rt::test]
    async fn test_close_before_start() {
        let metrics = metrics();
        let conn = SafeConn::new("U1", "T1", small_config(), metrics.clone());
        conn.send("queued").unwrap();
        assert!(conn.close(CloseReason::Shutdown).await);
        assert_eq!(metrics.active_connections.get(), 0);

        let (sink, _written) = ChannelSink::new();
        let (source, _frames) = ChannelSource::new();
        assert!(matches!(
            conn.start(Box::new(sink), source),
            Err(SessionError::Closed)
        ));
    }

    #[actix_rt::test]
    async fn test_drop_without_close_keeps_gauge_consistent() {
        let metrics = metrics();
        {
            let _conn = SafeConn::new("U1", "T1", small_config(), metrics.clone());
            assert_eq!(metrics.active_connections.get(), 1);
        }
        assert_eq!(metrics.active_connections.get(), 0);
    }

    #[actix_rt::test]
    async fn test_inbound_frames_in_order_and_pong_replies() {
        let conn = SafeConn::new("U1", "T1", SessionConfig::default(), metrics());
        let (sink, mut written) = ChannelSink::new();
        let (source, frames) = ChannelSource::new();
        let mut inbound = conn.start(Box::new(sink), source).unwrap();

        frames.send(Ok(Frame::Text("a".into()))).unwrap();
        frames.send(Ok(Frame::Ping(bytes::Bytes::from_static(b"hi")))).unwrap();
        frames.send(Ok(Frame::Text("b".into()))).unwrap();

        assert_eq!(inbound.recv().await.as_deref(), Some("a"));
        assert_eq!(inbound.recv().await.as_deref(), Some("b"));
        assert_eq!(
            next_written(&mut written).await,
            Written::Frame(OutFrame::Pong(bytes::Bytes::from_static(b"hi")))
        );
        conn.close(CloseReason::Normal).await;
        assert_eq!(inbound.recv().await, None);
    }

    #[actix_rt::test]
    async fn test_oversized_message_closes_with_1009() {
        let metrics = metrics();
        let conn = SafeConn::new("U1", "T1", small_config(), metrics.clone());
        let (sink, mut written) = ChannelSink::new();
        let (source, frames) = ChannelSource::new();
        let _inbound = conn.start(Box::new(sink), source).unwrap();

        frames.send(Ok(Frame::Text("x".repeat(65)))).unwrap();
        conn.closed().await;

        assert_eq!(metrics.closed_with("message_too_large"), 1);
        loop {
            if let Written::Closed(code) = next_written(&mut written).await {
                assert_eq!(code, CLOSE_MESSAGE_TOO_BIG);
                break;
            }
        }
    }

    #[actix_rt::test]
    async fn test_missed_pong_times_out() {
        let metrics = metrics();
        let config = SessionConfig {
            pong_wait: Duration::from_millis(150),
            ping_period: Duration::from_millis(50),
            ..small_config()
        };
        let conn = SafeConn::new("U1", "T1", config, metrics.clone());
        let (sink, _written) = ChannelSink::new();
        let (source, _frames) = ChannelSource::new();
        let _inbound = conn.start(Box::new(sink), source).unwrap();

        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("session should time out");
        assert_eq!(metrics.closed_with("timeout"), 1);
    }

    #[actix_rt::test]
    async fn test_pong_rearms_read_deadline() {
        let metrics = metrics();
        let config = SessionConfig {
            pong_wait: Duration::from_millis(200),
            ping_period: Duration::from_millis(50),
            ..small_config()
        };
        let conn = SafeConn::new("U1", "T1", config, metrics.clone());
        let (sink, _written) = ChannelSink::new();
        let (source, frames) = ChannelSource::new();
        let _inbound = conn.start(Box::new(sink), source).unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            frames.send(Ok(Frame::Pong)).unwrap();
        }
        assert!(!conn.is_closed());
        conn.close(CloseReason::Normal).await;
    }

    #[actix_rt::test]
    async fn test_write_failure_closes_session() {
        let metrics = metrics();
        let conn = SafeConn::new("U1", "T1", small_config(), metrics.clone());
        let (sink, _written) = ChannelSink::failing();
        let (source, _frames) = ChannelSource::new();
        let _inbound = conn.start(Box::new(sink), source).unwrap();

        conn.send("doomed").unwrap();
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .expect("write failure should close the session");
        assert_eq!(metrics.closed_with("write_failed"), 1);
        assert_eq!(metrics.active_connections.get(), 0);
    }

    #[actix_rt::test]
    async fn test_peer_close_is_clean() {
        let metrics = metrics();
        let conn = SafeConn::new("U1", "T1", small_config(), metrics.clone());
        let (sink, _written) = ChannelSink::new();
        let (source, frames) = ChannelSource::new();
        let _inbound = conn.start(Box::new(sink), source).unwrap();

        frames.send(Ok(Frame::Close(Some(CLOSE_GOING_AWAY)))).unwrap();
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .unwrap();
        assert_eq!(metrics.closed_with("client_closed"), 1);
    }

    fn doomed_flag() -> bool {
        true
    }

    #[actix_rt::test]
    async fn test_panicking_task_closes_only_its_session() {
        let metrics = metrics();
        let doomed = SafeConn::new("U1", "T1", small_config(), metrics.clone());
        let healthy = SafeConn::new("U2", "T1", small_config(), metrics.clone());

        spawn_guarded(doomed.clone(), "test", async {
            if doomed_flag() {
                panic!("boom");
            }
            CloseReason::Normal
        });
        tokio::time::timeout(Duration::from_secs(2), doomed.closed())
            .await
            .unwrap();

        assert_eq!(metrics.closed_with("panic"), 1);
        assert!(!healthy.is_closed());
        assert_eq!(metrics.active_connections.get(), 1);
        healthy.close(CloseReason::Normal).await;
    }
}

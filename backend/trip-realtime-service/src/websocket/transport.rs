//! Frame-level transport seam between a session and the socket.
//!
//! Production wires `actix_ws::Session` / `actix_ws::MessageStream`; tests
//! wire in-memory channels. The sink is shared with the session's write mutex,
//! the source is owned by the read pump alone.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Reported when the peer's close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong,
    Close(Option<u16>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutFrame {
    Text(String),
    Ping,
    Pong(Bytes),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("frame exceeds the maximum message size")]
    Overflow,

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: OutFrame) -> Result<(), TransportError>;

    async fn close(self: Box<Self>, code: u16, reason: &str);
}

#[async_trait(?Send)]
pub trait FrameSource {
    /// `None` once the peer's stream has ended.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

pub struct ActixSink {
    session: actix_ws::Session,
}

impl ActixSink {
    pub fn new(session: actix_ws::Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl FrameSink for ActixSink {
    async fn send(&mut self, frame: OutFrame) -> Result<(), TransportError> {
        let result = match frame {
            OutFrame::Text(text) => self.session.text(text).await,
            OutFrame::Ping => self.session.ping(b"").await,
            OutFrame::Pong(payload) => self.session.pong(&payload).await,
        };
        result.map_err(|_| TransportError::Closed)
    }

    async fn close(self: Box<Self>, code: u16, reason: &str) {
        let reason = actix_ws::CloseReason {
            code: code.into(),
            description: Some(reason.to_string()),
        };
        let Self { session } = *self;
        if session.close(Some(reason)).await.is_err() {
            tracing::trace!("WebSocket already closed by peer");
        }
    }
}

/// Frames beyond the codec's own limit surface as `Overflow`; the session
/// enforces its smaller `max_message_size` on top.
pub struct ActixSource {
    stream: actix_ws::MessageStream,
}

impl ActixSource {
    pub fn new(stream: actix_ws::MessageStream) -> Self {
        Self { stream }
    }
}

#[async_trait(?Send)]
impl FrameSource for ActixSource {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(actix_ws::ProtocolError::Overflow) => {
                    return Some(Err(TransportError::Overflow))
                }
                Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
            };

            let frame = match message {
                actix_ws::Message::Text(text) => Frame::Text(text.to_string()),
                actix_ws::Message::Binary(bytes) => Frame::Binary(bytes),
                actix_ws::Message::Ping(bytes) => Frame::Ping(bytes),
                actix_ws::Message::Pong(_) => Frame::Pong,
                actix_ws::Message::Close(reason) => Frame::Close(reason.map(|r| r.code.into())),
                actix_ws::Message::Continuation(_) | actix_ws::Message::Nop => continue,
            };
            return Some(Ok(frame));
        }
    }
}

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::session::SafeConn;

/// Synthetic acknowledgement, always the first frame of a session.
pub const CONNECTED_FRAME: &str = "connected";

/// Inbound client messages
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    /// Any other type. Chat and presence go through the HTTP routes.
    #[serde(other)]
    Unsupported,
}

/// Outbound control messages
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
}

/// Consumes a session's inbound queue until the read pump stops.
pub async fn dispatch_inbound(conn: SafeConn, mut inbound: mpsc::Receiver<String>) {
    while let Some(text) = inbound.recv().await {
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Ping) => reply(&conn, &ServerMessage::Pong),
            Ok(ClientMessage::Unsupported) => {
                tracing::debug!(session_id = %conn.id(), "Ignoring unsupported client message");
            }
            Err(e) => {
                tracing::debug!(session_id = %conn.id(), error = %e, "Ignoring malformed client message");
            }
        }
    }
}

fn reply(conn: &SafeConn, message: &ServerMessage) {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server message");
            return;
        }
    };
    if let Err(e) = conn.send(text) {
        tracing::debug!(session_id = %conn.id(), error = %e, "Dropped reply");
    }
}

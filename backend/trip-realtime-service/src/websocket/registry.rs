use event_schema::Event;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::session::{spawn_guarded, CloseReason, SafeConn};
use crate::error::SessionError;

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub backpressured: usize,
    pub pruned: usize,
}

/// Live sessions per trip.
///
/// The registry only holds session handles; transports stay owned by the
/// sessions themselves.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    // trip_id -> sessions subscribed to that trip
    inner: Arc<RwLock<HashMap<String, Vec<SafeConn>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: SafeConn) {
        let mut guard = self.inner.write().await;
        let sessions = guard.entry(conn.trip_id().to_string()).or_default();
        sessions.push(conn.clone());

        tracing::debug!(
            session_id = %conn.id(),
            trip_id = %conn.trip_id(),
            sessions = sessions.len(),
            "Registered WebSocket session"
        );
    }

    /// Registers a started session and runs `dispatcher` under the session's
    /// panic guard. The session leaves the registry once it closes, whatever
    /// ended it.
    pub async fn attach<F>(&self, conn: SafeConn, dispatcher: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.register(conn.clone()).await;

        let guarded = conn.clone();
        spawn_guarded(conn.clone(), "dispatcher", async move {
            dispatcher.await;
            guarded.closed().await;
            CloseReason::Normal
        });

        let registry = self.clone();
        actix_rt::spawn(async move {
            conn.closed().await;
            registry.unregister(&conn).await;
            tracing::info!(session_id = %conn.id(), trip_id = %conn.trip_id(), "WebSocket session ended");
        });
    }

    /// Must be called when a session ends.
    pub async fn unregister(&self, conn: &SafeConn) {
        let mut guard = self.inner.write().await;
        if let Some(sessions) = guard.get_mut(conn.trip_id()) {
            sessions.retain(|s| s.id() != conn.id());
            if sessions.is_empty() {
                guard.remove(conn.trip_id());
            }
        }
    }

    /// Serializes `event` once and offers it to every session of its trip.
    pub async fn broadcast(&self, event: &Event) -> BroadcastReport {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Failed to serialize event for fan-out");
                return BroadcastReport::default();
            }
        };
        self.broadcast_raw(&event.trip_id, &payload).await
    }

    /// Backpressured sessions are counted and skipped; closed ones are pruned.
    pub async fn broadcast_raw(&self, trip_id: &str, payload: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut guard = self.inner.write().await;
        let Some(sessions) = guard.get_mut(trip_id) else {
            return report;
        };

        sessions.retain(|conn| match conn.send(payload) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(SessionError::Backpressure) => {
                report.backpressured += 1;
                true
            }
            Err(_) => {
                report.pruned += 1;
                false
            }
        });
        if sessions.is_empty() {
            guard.remove(trip_id);
        }

        if report.backpressured > 0 || report.pruned > 0 {
            tracing::debug!(
                trip_id,
                delivered = report.delivered,
                backpressured = report.backpressured,
                pruned = report.pruned,
                "Trip fan-out skipped sessions"
            );
        }
        report
    }

    pub async fn session_count(&self, trip_id: &str) -> usize {
        let guard = self.inner.read().await;
        guard.get(trip_id).map(Vec::len).unwrap_or(0)
    }

    pub async fn total(&self) -> usize {
        let guard = self.inner.read().await;
        guard.values().map(Vec::len).sum()
    }

    /// Closes every session, for graceful shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<SafeConn> = {
            let mut guard = self.inner.write().await;
            guard.drain().flat_map(|(_, sessions)| sessions).collect()
        };
        for conn in sessions {
            conn.close(CloseReason::Shutdown).await;
        }
    }
}

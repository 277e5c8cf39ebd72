use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Session metrics on their own registry, rendered next to the default
/// registry on `/metrics`.
#[derive(Clone)]
pub struct SessionMetrics {
    registry: Registry,
    pub active_connections: IntGauge,
    pub messages_dropped: IntCounter,
    pub backpressure_events: IntCounter,
    pub sessions_closed: IntCounterVec,
}

impl SessionMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let active_connections =
            IntGauge::new("ws_active_connections", "Open WebSocket sessions")?;
        let messages_dropped = IntCounter::new(
            "ws_messages_dropped_total",
            "Outbound frames rejected because the session queue was full or backpressured",
        )?;
        let backpressure_events = IntCounter::new(
            "ws_backpressure_events_total",
            "Transitions of a session into the backpressured state",
        )?;
        let sessions_closed = IntCounterVec::new(
            Opts::new("ws_sessions_closed_total", "Closed WebSocket sessions by reason"),
            &["reason"],
        )?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(backpressure_events.clone()))?;
        registry.register(Box::new(sessions_closed.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            messages_dropped,
            backpressure_events,
            sessions_closed,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn closed_with(&self, reason: &str) -> u64 {
        self.sessions_closed.with_label_values(&[reason]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_collide() {
        let a = SessionMetrics::new().unwrap();
        let b = SessionMetrics::new().unwrap();
        a.active_connections.inc();
        assert_eq!(a.active_connections.get(), 1);
        assert_eq!(b.active_connections.get(), 0);
        assert!(a
            .registry()
            .gather()
            .iter()
            .any(|family| family.get_name() == "ws_active_connections"));
    }
}

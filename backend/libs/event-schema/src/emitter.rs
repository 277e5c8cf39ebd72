use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::{Event, EventPublisher, EventType, PublishError};

/// Builds canonical events for domain mutations and publishes them.
#[derive(Clone)]
pub struct EventEmitter {
    publisher: Arc<dyn EventPublisher>,
    source: String,
}

impl EventEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, source: impl Into<String>) -> Self {
        Self {
            publisher,
            source: source.into(),
        }
    }

    pub async fn emit<P: Serialize>(
        &self,
        trip_id: &str,
        event_type: EventType,
        payload: &P,
        user_id: &str,
    ) -> Result<Event, PublishError> {
        self.emit_with_correlation(trip_id, event_type, payload, user_id, None)
            .await
    }

    pub async fn emit_with_correlation<P: Serialize>(
        &self,
        trip_id: &str,
        event_type: EventType,
        payload: &P,
        user_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<Event, PublishError> {
        let payload = canonical_payload(payload)?;
        let mut event = Event::new(
            event_type,
            trip_id,
            Some(user_id.to_string()),
            self.source.clone(),
            payload,
        );
        if let Some(correlation_id) = correlation_id {
            event = event.with_correlation_id(correlation_id);
        }
        event.validate()?;

        self.publisher.publish(trip_id, &event).await.map_err(|e| {
            tracing::error!(
                trip_id = %trip_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to publish event"
            );
            e
        })?;

        tracing::debug!(trip_id = %trip_id, event_type = %event.event_type, event_id = %event.id, "Event published");
        Ok(event)
    }
}

/// Marshal to bytes and back so consumers see a plain JSON map.
pub fn canonical_payload<P: Serialize>(payload: &P) -> Result<Value, PublishError> {
    let bytes = serde_json::to_vec(payload).map_err(|e| PublishError::Serialize(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| PublishError::Serialize(e.to_string()))
}

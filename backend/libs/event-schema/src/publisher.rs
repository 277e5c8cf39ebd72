use async_trait::async_trait;
use thiserror::Error;

use crate::Event;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialize(String),

    #[error("invalid event: {0}")]
    Invalid(String),

    #[error("failed to publish event: {0}")]
    PublishFailed(String),
}

/// Event channel port.
///
/// `publish` returns once the channel has accepted the event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, trip_id: &str, event: &Event) -> Result<(), PublishError>;

    /// Publish in order, stopping at the first failure.
    async fn publish_batch(&self, trip_id: &str, events: &[Event]) -> Result<(), PublishError> {
        for event in events {
            self.publish(trip_id, event).await?;
        }
        Ok(())
    }
}

//! Event channel adapters.
//!
//! In a multi-instance deployment every instance publishes to Redis and
//! every instance runs [`listen_trip_events`], so a mutation handled by one
//! instance reaches sessions connected to any of them. `LocalEventPublisher`
//! short-circuits the channel for single-process development and tests.

use async_trait::async_trait;
use event_schema::{trip_channel, Event, EventPublisher, PublishError};
use futures::StreamExt;
use redis::AsyncCommands;
use redis_utils::SharedConnectionManager;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::websocket::SessionRegistry;

const TRIP_CHANNEL_PATTERN: &str = "trip:*";
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Publishes events as JSON on `trip:<tripId>`.
#[derive(Clone)]
pub struct RedisEventPublisher {
    redis: SharedConnectionManager,
}

impl RedisEventPublisher {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, trip_id: &str, event: &Event) -> Result<(), PublishError> {
        let payload = event.to_json()?;
        let channel = trip_channel(trip_id);

        let mut conn = self.redis.lock().await.clone();
        let receivers: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(|e| PublishError::PublishFailed(e.to_string()))?;

        debug!(channel = %channel, receivers, event_id = %event.id, "Event published to Redis");
        Ok(())
    }
}

/// Delivers events straight to this process's sessions.
#[derive(Clone)]
pub struct LocalEventPublisher {
    registry: SessionRegistry,
}

impl LocalEventPublisher {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventPublisher for LocalEventPublisher {
    async fn publish(&self, trip_id: &str, event: &Event) -> Result<(), PublishError> {
        if event.trip_id != trip_id {
            return Err(PublishError::Invalid(format!(
                "event for trip {} published on trip {trip_id}",
                event.trip_id
            )));
        }
        let payload = event.to_json()?;
        let report = self.registry.broadcast_raw(trip_id, &payload).await;
        debug!(
            trip_id = %trip_id,
            delivered = report.delivered,
            backpressured = report.backpressured,
            "Event delivered locally"
        );
        Ok(())
    }
}

/// Fan one channel message out to the trip's local sessions.
///
/// Returns `false` when the message is not a valid event for its channel.
pub async fn deliver(registry: &SessionRegistry, channel: &str, payload: &str) -> bool {
    let Some(trip_id) = channel.strip_prefix("trip:") else {
        return false;
    };
    let event: Event = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Dropping malformed event");
            return false;
        }
    };
    if event.trip_id != trip_id {
        warn!(channel = %channel, event_trip_id = %event.trip_id, "Dropping event published on a foreign channel");
        return false;
    }

    let report = registry.broadcast_raw(trip_id, payload).await;
    debug!(
        trip_id = %trip_id,
        event_type = %event.event_type,
        delivered = report.delivered,
        backpressured = report.backpressured,
        pruned = report.pruned,
        "Event fanned out"
    );
    true
}

/// Subscribe to `trip:*` and fan every event out to local sessions.
///
/// Returns when the subscription stream ends or cannot be established.
pub async fn listen_trip_events(
    client: redis::Client,
    registry: SessionRegistry,
) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(TRIP_CHANNEL_PATTERN).await?;
    info!(pattern = TRIP_CHANNEL_PATTERN, "Subscribed to trip events");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                error!(channel = %channel, error = %e, "Failed to read event payload");
                continue;
            }
        };
        deliver(&registry, &channel, &payload).await;
    }

    warn!("Trip event subscription ended");
    Ok(())
}

/// Run [`listen_trip_events`] forever, reconnecting with capped exponential
/// backoff.
pub fn spawn_trip_event_listener(client: redis::Client, registry: SessionRegistry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Duration::from_millis(500);
        loop {
            match listen_trip_events(client.clone(), registry.clone()).await {
                Ok(()) => backoff = Duration::from_millis(500),
                Err(e) => {
                    error!(error = %e, retry_in = ?backoff, "Trip event listener failed");
                }
            }
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
        }
    })
}

use chrono::{DateTime, Utc};
/// Event schema for trip-scoped realtime events.
///
/// Every domain mutation produces one [`Event`] which is published on the
/// trip's channel (`trip:<tripId>`) and fanned out to connected sessions.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

pub mod emitter;
pub mod publisher;

pub use emitter::EventEmitter;
pub use publisher::{EventPublisher, PublishError};

/// Current schema version for all events
pub const SCHEMA_VERSION: u32 = 1;

/// Channel name for a trip's events.
pub fn trip_channel(trip_id: &str) -> String {
    format!("trip:{trip_id}")
}

/// Wire event types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    // Trip
    TripCreated,
    TripUpdated,
    TripDeleted,
    TripStarted,
    TripEnded,
    TripStatusUpdated,

    // Member
    MemberAdded,
    MemberRoleUpdated,
    MemberRemoved,

    // Invitation
    InvitationCreated,
    InvitationAccepted,
    InvitationStatusUpdated,

    // Todo
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
    TodoCompleted,

    // Chat
    ChatMessageSent,
    ChatMessageEdited,
    ChatMessageDeleted,
    ChatReactionAdded,
    ChatReactionRemoved,
    ChatReadReceipt,
    ChatTypingStatus,

    // Location / weather
    LocationUpdated,
    WeatherUpdated,
    WeatherAlert,

    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::TripCreated => "TRIP_CREATED",
            EventType::TripUpdated => "TRIP_UPDATED",
            EventType::TripDeleted => "TRIP_DELETED",
            EventType::TripStarted => "TRIP_STARTED",
            EventType::TripEnded => "TRIP_ENDED",
            EventType::TripStatusUpdated => "TRIP_STATUS_UPDATED",
            EventType::MemberAdded => "MEMBER_ADDED",
            EventType::MemberRoleUpdated => "MEMBER_ROLE_UPDATED",
            EventType::MemberRemoved => "MEMBER_REMOVED",
            EventType::InvitationCreated => "TRIP_INVITATION_CREATED",
            EventType::InvitationAccepted => "TRIP_INVITATION_ACCEPTED",
            EventType::InvitationStatusUpdated => "invitation_status_updated",
            EventType::TodoCreated => "TODO_CREATED",
            EventType::TodoUpdated => "TODO_UPDATED",
            EventType::TodoDeleted => "TODO_DELETED",
            EventType::TodoCompleted => "TODO_COMPLETED",
            EventType::ChatMessageSent => "CHAT_MESSAGE_SENT",
            EventType::ChatMessageEdited => "CHAT_MESSAGE_EDITED",
            EventType::ChatMessageDeleted => "CHAT_MESSAGE_DELETED",
            EventType::ChatReactionAdded => "CHAT_REACTION_ADDED",
            EventType::ChatReactionRemoved => "CHAT_REACTION_REMOVED",
            EventType::ChatReadReceipt => "CHAT_READ_RECEIPT",
            EventType::ChatTypingStatus => "CHAT_TYPING_STATUS",
            EventType::LocationUpdated => "LOCATION_UPDATED",
            EventType::WeatherUpdated => "WEATHER_UPDATED",
            EventType::WeatherAlert => "WEATHER_ALERT",
            EventType::Custom(name) => name,
        }
    }

    const KNOWN: [EventType; 26] = [
        EventType::TripCreated,
        EventType::TripUpdated,
        EventType::TripDeleted,
        EventType::TripStarted,
        EventType::TripEnded,
        EventType::TripStatusUpdated,
        EventType::MemberAdded,
        EventType::MemberRoleUpdated,
        EventType::MemberRemoved,
        EventType::InvitationCreated,
        EventType::InvitationAccepted,
        EventType::InvitationStatusUpdated,
        EventType::TodoCreated,
        EventType::TodoUpdated,
        EventType::TodoDeleted,
        EventType::TodoCompleted,
        EventType::ChatMessageSent,
        EventType::ChatMessageEdited,
        EventType::ChatMessageDeleted,
        EventType::ChatReactionAdded,
        EventType::ChatReactionRemoved,
        EventType::ChatReadReceipt,
        EventType::ChatTypingStatus,
        EventType::LocationUpdated,
        EventType::WeatherUpdated,
        EventType::WeatherAlert,
    ];

    /// Category prefix used for client-side routing (`TRIP`, `MEMBER`, ...).
    pub fn category(&self) -> &str {
        match self {
            EventType::InvitationCreated
            | EventType::InvitationAccepted
            | EventType::InvitationStatusUpdated => "INVITATION",
            other => other.as_str().split('_').next().unwrap_or_default(),
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        EventType::KNOWN
            .iter()
            .find(|known| known.as_str() == value)
            .cloned()
            .unwrap_or_else(|| EventType::Custom(value.to_string()))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(EventType::from(value.as_str()))
    }
}

/// Tracing metadata carried with every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Component that produced the event
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
}

/// Event envelope published on `trip:<tripId>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub trip_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub metadata: EventMetadata,
    /// Canonical map form of the mutation result
    pub payload: Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        trip_id: impl Into<String>,
        user_id: Option<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            trip_id: trip_id.into(),
            user_id: user_id.filter(|u| !u.is_empty()),
            timestamp: Utc::now(),
            version: SCHEMA_VERSION,
            metadata: EventMetadata {
                source: source.into(),
                correlation_id: None,
            },
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    /// Structural checks applied before publishing.
    pub fn validate(&self) -> Result<(), PublishError> {
        if self.trip_id.is_empty() {
            return Err(PublishError::Invalid("trip ID is required".into()));
        }
        if self.event_type.as_str().is_empty() {
            return Err(PublishError::Invalid("event type is required".into()));
        }
        if self.metadata.source.is_empty() {
            return Err(PublishError::Invalid("event source is required".into()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, PublishError> {
        serde_json::to_string(self).map_err(|e| PublishError::Serialize(e.to_string()))
    }
}

pub fn is_compatible(current_version: u32, message_version: u32) -> bool {
    current_version == message_version
}

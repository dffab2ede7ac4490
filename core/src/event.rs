//! Domain events and their wire envelope.
//!
//! Events are published strictly after the storage transaction that produced them
//! commits. Delivery is at-least-once, so every consumer must be idempotent.
//!
//! Payloads are encoded with `bincode`; the envelope carries the event type and a
//! partition key (the match id) so all events for one match stay ordered.

use crate::ids::MatchId;
use crate::matches::{GeoPoint, Match};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Topic carrying [`MatchSearchEvent`]s.
pub const MATCH_SEARCH_TOPIC: &str = "match-search-events";

/// Error types for event encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The envelope names a type this consumer does not understand.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// An event that can travel through the event bus.
///
/// `event_type()` returns a stable, versioned identifier such as `"MatchBecameSearchable.v1"`.
pub trait Event: Send + Sync + 'static {
    /// Versioned type identifier.
    fn event_type(&self) -> &'static str;

    /// Partition key. Events sharing a key are delivered in order.
    fn partition_key(&self) -> String;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes do not decode.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Envelope put on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Versioned type identifier.
    pub event_type: String,
    /// Partition key.
    pub key: String,
    /// Bincode payload.
    pub data: Vec<u8>,
}

impl SerializedEvent {
    /// Create an envelope from raw parts.
    #[must_use]
    pub const fn new(event_type: String, key: String, data: Vec<u8>) -> Self {
        Self {
            event_type,
            key,
            data,
        }
    }

    /// Encode an event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn from_event<E: Event + Serialize>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            key: event.partition_key(),
            data: event.to_bytes()?,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, key: {}, size: {} bytes }}",
            self.event_type,
            self.key,
            self.data.len()
        )
    }
}

/// Changes in a match's membership of the searchable set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MatchSearchEvent {
    /// The match entered `{Pending, Confirmed}` (or moved).
    MatchBecameSearchable {
        /// Match id
        match_id: MatchId,
        /// Degrees east
        longitude: f64,
        /// Degrees north
        latitude: f64,
    },
    /// The match left `{Pending, Confirmed}`.
    MatchLeftSearchIndex {
        /// Match id
        match_id: MatchId,
    },
}

impl MatchSearchEvent {
    /// Event for a match now in the searchable set.
    #[must_use]
    pub const fn became_searchable(m: &Match) -> Self {
        Self::MatchBecameSearchable {
            match_id: m.id,
            longitude: m.location.longitude,
            latitude: m.location.latitude,
        }
    }

    /// Event for a match no longer in the searchable set.
    #[must_use]
    pub const fn left_search_index(match_id: MatchId) -> Self {
        Self::MatchLeftSearchIndex { match_id }
    }

    /// The match this event is about.
    #[must_use]
    pub const fn match_id(&self) -> MatchId {
        match self {
            Self::MatchBecameSearchable { match_id, .. } | Self::MatchLeftSearchIndex { match_id } => {
                *match_id
            }
        }
    }

    /// Event to publish for a committed transition, if searchability changed.
    #[must_use]
    pub fn for_transition(before: &Match, after: &Match) -> Option<Self> {
        match (before.is_searchable(), after.is_searchable()) {
            (false, true) => Some(Self::became_searchable(after)),
            (true, false) => Some(Self::left_search_index(after.id)),
            _ => None,
        }
    }

    /// Decode from an envelope, checking the type tag.
    ///
    /// # Errors
    ///
    /// [`EventError::UnknownEventType`] for foreign envelopes,
    /// [`EventError::DeserializationError`] for corrupt payloads.
    pub fn decode(envelope: &SerializedEvent) -> Result<Self, EventError> {
        match envelope.event_type.as_str() {
            Self::BECAME_SEARCHABLE | Self::LEFT_SEARCH_INDEX => Self::from_bytes(&envelope.data),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }

    /// Coordinates carried by a `MatchBecameSearchable` event.
    #[must_use]
    pub const fn point(&self) -> Option<GeoPoint> {
        match self {
            Self::MatchBecameSearchable {
                longitude, latitude, ..
            } => Some(GeoPoint {
                longitude: *longitude,
                latitude: *latitude,
            }),
            Self::MatchLeftSearchIndex { .. } => None,
        }
    }

    const BECAME_SEARCHABLE: &'static str = "MatchBecameSearchable.v1";
    const LEFT_SEARCH_INDEX: &'static str = "MatchLeftSearchIndex.v1";
}

impl Event for MatchSearchEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::MatchBecameSearchable { .. } => Self::BECAME_SEARCHABLE,
            Self::MatchLeftSearchIndex { .. } => Self::LEFT_SEARCH_INDEX,
        }
    }

    fn partition_key(&self) -> String {
        self.match_id().to_string()
    }
}

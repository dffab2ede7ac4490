//! Event bus abstraction for post-commit notifications.
//!
//! ```text
//! ┌──────────────────────┐
//! │ Participation / host │
//! │      operation       │
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │ 1. Commit WriteBatch │◄─── Source of truth
//! └──────────┬───────────┘
//!            │ only after commit
//!            ▼
//! ┌──────────────────────┐
//! │ 2. Publish event     │◄─── At-least-once, best effort
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │ Spatial index sync   │◄─── Idempotent consumer
//! └──────────────────────┘
//! ```
//!
//! A failed publish never rolls back the write that preceded it. Lost events are
//! repaired by the reconciliation pass.
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `matchup-testing`
//! - `RedpandaEventBus` in `matchup-redpanda`

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an envelope
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of envelopes from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Publish/subscribe transport.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be shared as `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish an envelope to `topic`, partitioned by `event.key`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker does not acknowledge.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to `topics`. Delivery is at-least-once.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the subscription cannot be set up.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_failure_names_topic() {
        let err = EventBusError::PublishFailed {
            topic: "match-search-events".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Publish failed for topic 'match-search-events': timeout"
        );
    }
}

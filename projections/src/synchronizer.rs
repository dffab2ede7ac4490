//! `SpatialIndexSynchronizer`: keeps the geo index in step with search events.
//!
//! # Overview
//!
//! ```text
//! ┌──────────────┐  commit   ┌─────────────┐  MatchSearchEvent  ┌──────────────┐
//! │ Capacity /   │ ────────▶ │  Event Bus  │ ─────────────────▶ │ Synchronizer │
//! │ Scheduler    │           │ (Redpanda)  │                    └──────┬───────┘
//! └──────────────┘           └─────────────┘                           │ add / remove
//!                                                                      ▼
//!                                                              ┌──────────────┐
//!                                                              │ SpatialIndex │
//!                                                              └──────────────┘
//! ```
//!
//! Delivery is at-least-once, so every index operation is idempotent: adding a
//! present member only moves it, removing an absent member does nothing. Events
//! that cannot be applied are logged and skipped; [`IndexReconciler`] repairs the drift.
//!
//! [`IndexReconciler`]: crate::reconcile::IndexReconciler

use futures::StreamExt;
use matchup_core::event::{MATCH_SEARCH_TOPIC, MatchSearchEvent, SerializedEvent};
use matchup_core::event_bus::EventBus;
use matchup_core::spatial_index::{IndexError, SpatialIndex};
use matchup_runtime::metrics::SpatialIndexMetrics;
use matchup_runtime::retry::{RetryPolicy, retry_with_backoff};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that stop the synchronizer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Could not subscribe to the search topic
    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe {
        /// Topic name
        topic: String,
        /// Underlying error
        reason: String,
    },
}

/// Consumes [`MatchSearchEvent`]s and applies them to a [`SpatialIndex`].
///
/// The event bus must already be configured with the synchronizer's consumer group.
pub struct SpatialIndexSynchronizer {
    index: Arc<dyn SpatialIndex>,
    event_bus: Arc<dyn EventBus>,
    topic: String,
    consumer_group: String,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl SpatialIndexSynchronizer {
    /// Create a synchronizer on [`MATCH_SEARCH_TOPIC`].
    ///
    /// Returns the synchronizer and a shutdown sender; send `true` to stop it.
    #[must_use]
    pub fn new(
        index: Arc<dyn SpatialIndex>,
        event_bus: Arc<dyn EventBus>,
        consumer_group: impl Into<String>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let synchronizer = Self {
            index,
            event_bus,
            topic: MATCH_SEARCH_TOPIC.to_string(),
            consumer_group: consumer_group.into(),
            retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(2))
                .build(),
            shutdown: shutdown_rx,
        };
        (synchronizer, shutdown_tx)
    }

    /// Listen on a shared shutdown channel instead of the private one.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Subscribe to a different topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Retry policy for index writes.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Apply one event to the index.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if the index rejects the write.
    pub async fn apply(&self, event: &MatchSearchEvent) -> Result<(), IndexError> {
        match event.point() {
            Some(point) => {
                self.index.add(event.match_id(), point).await?;
                SpatialIndexMetrics::record_op("add");
            }
            None => {
                self.index.remove(event.match_id()).await?;
                SpatialIndexMetrics::record_op("remove");
            }
        }
        Ok(())
    }

    /// Process events until shutdown.
    ///
    /// Undecodable envelopes and index failures (after retries) are logged and
    /// skipped so one bad event cannot stall the stream.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Subscribe`] if the subscription cannot be set up.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        tracing::info!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            "Starting spatial index synchronizer"
        );

        let mut stream = self
            .event_bus
            .subscribe(&[self.topic.as_str()])
            .await
            .map_err(|e| SyncError::Subscribe {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })?;

        while !*self.shutdown.borrow() {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(envelope)) => self.process(&envelope).await,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Error receiving search event");
                    }
                    None => {
                        tracing::warn!(topic = %self.topic, "Search event stream ended");
                        break;
                    }
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Spatial index synchronizer stopped");
        Ok(())
    }

    async fn process(&self, envelope: &SerializedEvent) {
        let event = match MatchSearchEvent::decode(envelope) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(event_type = %envelope.event_type, key = %envelope.key, error = %e, "Skipping undecodable event");
                return;
            }
        };

        if let Err(e) = retry_with_backoff(self.retry.clone(), || self.apply(&event)).await {
            tracing::error!(
                match_id = %event.match_id(),
                event_type = %envelope.event_type,
                error = %e,
                "Failed to apply search event; reconciliation will repair the index"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use matchup_testing::InMemorySpatialIndex;
    use matchup_testing::InMemoryEventBus;
    use matchup_testing::fixtures::MatchBuilder;

    fn synchronizer(index: &InMemorySpatialIndex, bus: &InMemoryEventBus) -> (SpatialIndexSynchronizer, watch::Sender<bool>) {
        let (sync, tx) = SpatialIndexSynchronizer::new(
            Arc::new(index.clone()),
            Arc::new(bus.clone()),
            "spatial-index-sync",
        );
        (
            sync.with_retry(RetryPolicy::builder().max_retries(0).build()),
            tx,
        )
    }

    #[tokio::test]
    async fn apply_is_idempotent_in_both_directions() {
        let index = InMemorySpatialIndex::new();
        let (sync, _tx) = synchronizer(&index, &InMemoryEventBus::new());
        let m = MatchBuilder::new().build();

        let add = MatchSearchEvent::became_searchable(&m);
        sync.apply(&add).await.unwrap();
        sync.apply(&add).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.position(m.id), Some(m.location));

        let remove = MatchSearchEvent::left_search_index(m.id);
        sync.apply(&remove).await.unwrap();
        sync.apply(&remove).await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn foreign_envelopes_are_skipped() {
        let index = InMemorySpatialIndex::new();
        let (sync, _tx) = synchronizer(&index, &InMemoryEventBus::new());

        sync.process(&SerializedEvent::new("Other.v1".to_string(), "k".to_string(), vec![0]))
            .await;

        assert_eq!(index.write_count(), 0);
    }

    #[tokio::test]
    async fn index_outage_does_not_stop_processing() {
        let index = InMemorySpatialIndex::new();
        let (sync, _tx) = synchronizer(&index, &InMemoryEventBus::new());
        let m = MatchBuilder::new().build();
        let envelope = SerializedEvent::from_event(&MatchSearchEvent::became_searchable(&m)).unwrap();

        index.set_unavailable(true);
        sync.process(&envelope).await;
        index.set_unavailable(false);
        sync.process(&envelope).await;

        assert!(index.contains(m.id));
    }
}

//! After-commit publication of search index events.
//!
//! Write paths hand events to [`SearchEventPublisher::dispatch`] only once the
//! originating write has committed, so a rolled-back transaction can never reach the
//! index. Dispatch never waits on the broker: it enqueues into a bounded outbox and a
//! single relay task drains it in order, publishing with a short retry. A full outbox
//! or an exhausted retry drops the event with a log line and a counter; reconciliation
//! repairs the index afterwards.

use crate::metrics::SearchEventMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use matchup_core::event::{MATCH_SEARCH_TOPIC, MatchSearchEvent, SerializedEvent};
use matchup_core::event_bus::EventBus;
use matchup_core::matches::Match;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// Default number of events the outbox holds before dispatch starts dropping.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

enum Outgoing {
    Event(MatchSearchEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle for queueing [`MatchSearchEvent`]s. Cheap to clone.
///
/// The relay task stops once every handle has been dropped.
#[derive(Clone)]
pub struct SearchEventPublisher {
    outbox: mpsc::Sender<Outgoing>,
}

impl SearchEventPublisher {
    /// Publisher on [`MATCH_SEARCH_TOPIC`] with two quick retries.
    ///
    /// Spawns the relay, so this must run inside a Tokio runtime.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self::builder(bus).spawn()
    }

    /// Configure topic, retry and outbox size before spawning the relay.
    #[must_use]
    pub fn builder(bus: Arc<dyn EventBus>) -> SearchEventPublisherBuilder {
        SearchEventPublisherBuilder {
            bus,
            topic: MATCH_SEARCH_TOPIC.to_string(),
            retry: RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(1))
                .build(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }

    /// Queue `event` for publication without waiting for the broker.
    pub fn dispatch(&self, event: MatchSearchEvent) {
        let match_id = event.match_id();
        match self.outbox.try_send(Outgoing::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                SearchEventMetrics::record_overflow();
                tracing::warn!(match_id = %match_id, "Search event outbox full; dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                SearchEventMetrics::record_overflow();
                tracing::error!(match_id = %match_id, "Search event relay is gone; dropping event");
            }
        }
    }

    /// Queue the event implied by a committed `before -> after` change, if any.
    pub fn publish_transition(&self, before: &Match, after: &Match) {
        if let Some(event) = MatchSearchEvent::for_transition(before, after) {
            self.dispatch(event);
        }
    }

    /// Wait until everything dispatched before this call was published or dropped.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.outbox.send(Outgoing::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Builder for [`SearchEventPublisher`].
pub struct SearchEventPublisherBuilder {
    bus: Arc<dyn EventBus>,
    topic: String,
    retry: RetryPolicy,
    outbox_capacity: usize,
}

impl SearchEventPublisherBuilder {
    /// Publish to `topic` instead of [`MATCH_SEARCH_TOPIC`].
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Retry policy for each event.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Outbox size; zero is raised to one.
    #[must_use]
    pub fn outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    /// Spawn the relay and return the handle feeding it.
    #[must_use]
    pub fn spawn(self) -> SearchEventPublisher {
        let (outbox, pending) = mpsc::channel(self.outbox_capacity);
        let relay = Relay {
            bus: self.bus,
            topic: self.topic,
            retry: self.retry,
        };
        tokio::spawn(relay.run(pending));
        SearchEventPublisher { outbox }
    }
}

struct Relay {
    bus: Arc<dyn EventBus>,
    topic: String,
    retry: RetryPolicy,
}

impl Relay {
    async fn run(self, mut pending: mpsc::Receiver<Outgoing>) {
        while let Some(item) = pending.recv().await {
            match item {
                Outgoing::Event(event) => {
                    self.deliver(&event).await;
                }
                Outgoing::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        tracing::debug!(topic = %self.topic, "Search event relay stopped");
    }

    /// Returns whether the broker acknowledged `event`.
    async fn deliver(&self, event: &MatchSearchEvent) -> bool {
        let envelope = match SerializedEvent::from_event(event) {
            Ok(envelope) => envelope,
            Err(e) => {
                SearchEventMetrics::record_failure();
                tracing::error!(match_id = %event.match_id(), error = %e, "Failed to encode search event");
                return false;
            }
        };

        let result = retry_with_backoff(self.retry.clone(), || {
            self.bus.publish(&self.topic, &envelope)
        })
        .await;

        match result {
            Ok(()) => {
                SearchEventMetrics::record_published();
                tracing::debug!(
                    match_id = %event.match_id(),
                    event_type = %envelope.event_type,
                    "Search event published"
                );
                true
            }
            Err(e) => {
                SearchEventMetrics::record_failure();
                tracing::error!(
                    match_id = %event.match_id(),
                    event_type = %envelope.event_type,
                    error = %e,
                    "Search event dropped; reconciliation will repair the index"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use matchup_core::matches::MatchStatus;
    use matchup_testing::InMemoryEventBus;
    use matchup_testing::fixtures::MatchBuilder;
    use tokio::time::Instant;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    fn fast(bus: &InMemoryEventBus) -> SearchEventPublisher {
        SearchEventPublisher::builder(Arc::new(bus.clone()))
            .retry(quick_retry())
            .spawn()
    }

    fn decoded(bus: &InMemoryEventBus) -> Vec<MatchSearchEvent> {
        bus.published(MATCH_SEARCH_TOPIC)
            .iter()
            .map(|e| MatchSearchEvent::decode(e).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn searchability_change_is_published_keyed_by_match() {
        let bus = InMemoryEventBus::new();
        let publisher = fast(&bus);
        let before = MatchBuilder::new().build();
        let after = before.start().unwrap();

        publisher.publish_transition(&before, &after);
        publisher.flush().await;

        let published = bus.published(MATCH_SEARCH_TOPIC);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, before.id.to_string());
        assert_eq!(decoded(&bus), vec![MatchSearchEvent::left_search_index(before.id)]);
    }

    #[tokio::test]
    async fn unchanged_searchability_publishes_nothing() {
        let bus = InMemoryEventBus::new();
        let publisher = fast(&bus);
        let before = MatchBuilder::new().status(MatchStatus::Pending).build();
        let after = before.with_participant_delta(1).unwrap();

        publisher.publish_transition(&before, &after);
        publisher.flush().await;

        assert!(bus.published(MATCH_SEARCH_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn broker_outage_is_swallowed() {
        let bus = InMemoryEventBus::new();
        bus.set_failing(true);
        let relay = Relay {
            bus: Arc::new(bus.clone()),
            topic: MATCH_SEARCH_TOPIC.to_string(),
            retry: quick_retry(),
        };
        let m = MatchBuilder::new().build();

        assert!(!relay.deliver(&MatchSearchEvent::became_searchable(&m)).await);
        assert!(bus.published(MATCH_SEARCH_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn dispatch_does_not_wait_for_a_slow_broker() {
        let bus = InMemoryEventBus::new();
        bus.set_latency(Duration::from_millis(500));
        let publisher = fast(&bus);
        let m = MatchBuilder::new().build();

        let started = Instant::now();
        publisher.dispatch(MatchSearchEvent::became_searchable(&m));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(bus.published(MATCH_SEARCH_TOPIC).is_empty());

        publisher.flush().await;
        assert_eq!(decoded(&bus), vec![MatchSearchEvent::became_searchable(&m)]);
    }

    #[tokio::test]
    async fn events_keep_dispatch_order() {
        let bus = InMemoryEventBus::new();
        let publisher = fast(&bus);
        let m = MatchBuilder::new().build();
        let sequence = vec![
            MatchSearchEvent::left_search_index(m.id),
            MatchSearchEvent::became_searchable(&m),
            MatchSearchEvent::left_search_index(m.id),
        ];

        for event in &sequence {
            publisher.dispatch(event.clone());
        }
        publisher.flush().await;

        assert_eq!(decoded(&bus), sequence);
    }

    #[tokio::test]
    async fn full_outbox_drops_instead_of_blocking() {
        let bus = InMemoryEventBus::new();
        let publisher = SearchEventPublisher::builder(Arc::new(bus.clone()))
            .retry(quick_retry())
            .outbox_capacity(1)
            .spawn();
        let m = MatchBuilder::new().build();

        // The relay cannot run before the first await on this single-threaded runtime.
        publisher.dispatch(MatchSearchEvent::became_searchable(&m));
        publisher.dispatch(MatchSearchEvent::left_search_index(m.id));
        publisher.dispatch(MatchSearchEvent::became_searchable(&m));
        publisher.flush().await;

        assert_eq!(decoded(&bus), vec![MatchSearchEvent::became_searchable(&m)]);
    }
}

//! Host-side match operations: create, cancel, reactivate, change capacity.

use crate::capacity::CapacityConfig;
use crate::publisher::SearchEventPublisher;
use crate::retry::retry_with_predicate;
use matchup_core::environment::Clock;
use matchup_core::event::MatchSearchEvent;
use matchup_core::ids::{MatchId, UserId};
use matchup_core::matches::{Match, MatchDraft};
use matchup_core::policy::LifecyclePolicy;
use matchup_core::store::{VersionedEntityStore, VersionedWrite, WriteBatch, committed_match};
use matchup_core::{LifecycleError, Result};
use std::sync::Arc;

/// Host operations on whole matches.
///
/// Status writes go through the same compare-and-set as capacity changes, so a host
/// cancel racing a join is linearized by the match version.
#[derive(Clone)]
pub struct MatchHosting {
    store: Arc<dyn VersionedEntityStore>,
    events: SearchEventPublisher,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
    retry: CapacityConfig,
}

impl MatchHosting {
    /// Wire hosting over shared collaborators. `retry` bounds conflict retries.
    #[must_use]
    pub fn new(
        store: Arc<dyn VersionedEntityStore>,
        events: SearchEventPublisher,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
        retry: CapacityConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            policy,
            retry,
        }
    }

    /// Create a match from `draft`; it starts `Pending` with the host in one slot.
    ///
    /// # Errors
    ///
    /// `InvalidMatch` for policy violations, `OverlappingHosting` if the host already
    /// runs an active match at an overlapping time, or a store failure.
    #[tracing::instrument(skip(self, draft), fields(host_id = %draft.host_id))]
    pub async fn create_match(&self, draft: MatchDraft) -> Result<Match> {
        let now = self.clock.now();
        self.policy.validate_draft(&draft, now)?;

        let hosted = self.store.active_matches_for_host(draft.host_id).await?;
        if let Some(clash) = hosted.iter().find(|m| m.schedule.overlaps(&draft.schedule)) {
            return Err(LifecycleError::OverlappingHosting(clash.id));
        }

        let created = Match::create(MatchId::new(), draft);
        self.store
            .commit(WriteBatch::new().with(VersionedWrite::InsertMatch(created.clone())))
            .await?;

        tracing::info!(match_id = %created.id, "Match created");
        self.events.dispatch(MatchSearchEvent::became_searchable(&created));
        Ok(created)
    }

    /// Host cancels the match.
    ///
    /// # Errors
    ///
    /// `MatchNotFound`, `NotHost`, `MatchAlreadyStarted`, `CancelWindowExceeded`,
    /// `InvalidStateTransition`, `CapacityConflict` after repeated version conflicts.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_match(&self, match_id: MatchId, host_id: UserId) -> Result<Match> {
        self.transition(match_id, |m, now, policy| m.cancel(host_id, now, policy))
            .await
    }

    /// Host reactivates a cancelled match within the reactivation window.
    ///
    /// # Errors
    ///
    /// `MatchNotFound`, `NotHost`, `CannotReactivate`, `CapacityConflict`.
    #[tracing::instrument(skip(self))]
    pub async fn reactivate_match(&self, match_id: MatchId, host_id: UserId) -> Result<Match> {
        self.transition(match_id, |m, now, policy| m.reactivate(host_id, now, policy))
            .await
    }

    /// Host changes the match capacity.
    ///
    /// The write is checked against the match version like any join or leave, so a
    /// capacity change racing a join is linearized: either the join sees the new
    /// capacity or the update sees the new count.
    ///
    /// # Errors
    ///
    /// `MatchNotFound`, `NotHost`, `InvalidMatch`, `CapacityBelowParticipants`,
    /// `MatchAlreadyStarted`, `InvalidStateTransition`, `CapacityConflict`.
    #[tracing::instrument(skip(self))]
    pub async fn update_capacity(
        &self,
        match_id: MatchId,
        host_id: UserId,
        max_participants: u32,
    ) -> Result<Match> {
        self.transition(match_id, |m, now, policy| {
            m.with_max_participants(host_id, max_participants, now, policy)
        })
        .await
    }

    async fn transition<F>(&self, match_id: MatchId, apply: F) -> Result<Match>
    where
        F: Fn(&Match, matchup_core::DateTime<matchup_core::Utc>, &LifecyclePolicy) -> Result<Match>,
    {
        let policy = self.retry.retry_policy();
        let max_attempts = policy.max_attempts();

        let (before, after) = retry_with_predicate(
            policy,
            || {
                let apply = &apply;
                async move {
                    let before = self
                        .store
                        .load_match(match_id)
                        .await?
                        .ok_or(LifecycleError::MatchNotFound(match_id))?;
                    let after = apply(&before, self.clock.now(), &self.policy)?;
                    self.store
                        .commit(WriteBatch::new().with(VersionedWrite::UpdateMatch(after.clone())))
                        .await?;
                    Ok::<_, LifecycleError>((before, committed_match(after)))
                }
            },
            LifecycleError::is_version_conflict,
        )
        .await
        .map_err(|e| {
            if e.is_version_conflict() {
                LifecycleError::CapacityConflict {
                    match_id,
                    attempts: max_attempts,
                }
            } else {
                e
            }
        })?;

        tracing::info!(
            match_id = %match_id,
            from = %before.status,
            to = %after.status,
            max_participants = after.max_participants,
            "Match updated"
        );
        self.events.publish_transition(&before, &after);
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::capacity::CapacityCoordinator;
    use crate::participation::ParticipationLifecycle;
    use matchup_core::event::MATCH_SEARCH_TOPIC;
    use matchup_core::matches::MatchStatus;
    use matchup_testing::fixtures::MatchBuilder;
    use matchup_testing::{InMemoryEventBus, InMemoryMatchStore, ManualClock, test_epoch};
    use std::time::Duration;

    fn quick() -> CapacityConfig {
        CapacityConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn hosting(store: &InMemoryMatchStore, events: &SearchEventPublisher, clock: Arc<ManualClock>) -> MatchHosting {
        MatchHosting::new(
            Arc::new(store.clone()),
            events.clone(),
            clock,
            LifecyclePolicy::default(),
            quick(),
        )
    }

    fn quiet() -> SearchEventPublisher {
        SearchEventPublisher::new(Arc::new(InMemoryEventBus::new()))
    }

    async fn announced(events: &SearchEventPublisher, bus: &InMemoryEventBus) -> Vec<MatchSearchEvent> {
        events.flush().await;
        bus.published(MATCH_SEARCH_TOPIC)
            .iter()
            .map(|e| MatchSearchEvent::decode(e).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn created_match_is_pending_with_host_slot_and_announced() {
        let store = InMemoryMatchStore::new();
        let bus = InMemoryEventBus::new();
        let events = SearchEventPublisher::new(Arc::new(bus.clone()));
        let hosting = hosting(&store, &events, Arc::new(ManualClock::default()));

        let m = hosting.create_match(MatchBuilder::new().draft()).await.unwrap();

        assert_eq!(m.status, MatchStatus::Pending);
        assert_eq!(m.current_participants, 1);
        assert_eq!(store.match_snapshot(m.id).unwrap(), m);
        assert_eq!(
            announced(&events, &bus).await,
            vec![MatchSearchEvent::became_searchable(&m)]
        );
    }

    #[tokio::test]
    async fn overlapping_hosting_is_refused() {
        let store = InMemoryMatchStore::new();
        let hosting = hosting(&store, &quiet(), Arc::new(ManualClock::default()));
        let builder = MatchBuilder::new();

        let first = hosting.create_match(builder.draft()).await.unwrap();
        let err = hosting.create_match(builder.draft()).await.unwrap_err();

        assert_eq!(err, LifecycleError::OverlappingHosting(first.id));
    }

    #[tokio::test]
    async fn small_capacity_is_invalid() {
        let store = InMemoryMatchStore::new();
        let hosting = hosting(&store, &quiet(), Arc::new(ManualClock::default()));

        let err = hosting
            .create_match(MatchBuilder::new().capacity(2).draft())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidMatch(_)));
    }

    #[tokio::test]
    async fn cancel_then_reactivate_round_trips_searchability() {
        let store = InMemoryMatchStore::new();
        let bus = InMemoryEventBus::new();
        let events = SearchEventPublisher::new(Arc::new(bus.clone()));
        let clock = Arc::new(ManualClock::default());
        let hosting = hosting(&store, &events, clock.clone());
        let m = MatchBuilder::new().build();
        store.seed_match(m.clone());

        let cancelled = hosting.cancel_match(m.id, m.host_id).await.unwrap();
        assert_eq!(cancelled.status, MatchStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(test_epoch()));

        clock.advance(chrono::Duration::minutes(30));
        let back = hosting.reactivate_match(m.id, m.host_id).await.unwrap();
        assert_eq!(back.status, MatchStatus::Pending);
        assert_eq!(back.cancelled_at, None);

        assert_eq!(
            announced(&events, &bus).await,
            vec![
                MatchSearchEvent::left_search_index(m.id),
                MatchSearchEvent::became_searchable(&back),
            ]
        );
    }

    #[tokio::test]
    async fn reactivation_window_expires() {
        let store = InMemoryMatchStore::new();
        let clock = Arc::new(ManualClock::default());
        let hosting = hosting(&store, &quiet(), clock.clone());
        let m = MatchBuilder::new().build();
        store.seed_match(m.clone());

        hosting.cancel_match(m.id, m.host_id).await.unwrap();
        clock.advance(chrono::Duration::minutes(61));

        let err = hosting.reactivate_match(m.id, m.host_id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::CannotReactivate(_)));
    }

    #[tokio::test]
    async fn persistent_conflicts_surface_as_retryable() {
        let store = InMemoryMatchStore::new();
        let hosting = hosting(&store, &quiet(), Arc::new(ManualClock::default()));
        let m = MatchBuilder::new().build();
        store.seed_match(m.clone());
        store.inject_conflicts(10);

        let err = hosting.cancel_match(m.id, m.host_id).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn shrinking_to_the_count_fills_the_match_and_growing_reopens_it() {
        let store = InMemoryMatchStore::new();
        let bus = InMemoryEventBus::new();
        let events = SearchEventPublisher::new(Arc::new(bus.clone()));
        let hosting = hosting(&store, &events, Arc::new(ManualClock::default()));
        let m = MatchBuilder::new().capacity(6).participants(4).build();
        store.seed_match(m.clone());

        let full = hosting.update_capacity(m.id, m.host_id, 4).await.unwrap();
        assert_eq!(full.status, MatchStatus::Full);
        assert_eq!(full.version, m.version.next());

        let reopened = hosting.update_capacity(m.id, m.host_id, 8).await.unwrap();
        assert_eq!(reopened.status, MatchStatus::Pending);
        assert_eq!(store.match_snapshot(m.id).unwrap(), reopened);

        assert_eq!(
            announced(&events, &bus).await,
            vec![
                MatchSearchEvent::left_search_index(m.id),
                MatchSearchEvent::became_searchable(&reopened),
            ]
        );
    }

    #[tokio::test]
    async fn capacity_below_the_count_is_refused() {
        let store = InMemoryMatchStore::new();
        let hosting = hosting(&store, &quiet(), Arc::new(ManualClock::default()));
        let m = MatchBuilder::new().capacity(10).participants(6).build();
        store.seed_match(m.clone());

        let err = hosting.update_capacity(m.id, m.host_id, 5).await.unwrap_err();

        assert!(matches!(err, LifecycleError::CapacityBelowParticipants { current: 6, requested: 5, .. }));
        assert_eq!(store.match_snapshot(m.id).unwrap(), m);
        assert_eq!(
            hosting.update_capacity(m.id, UserId::new(), 8).await.unwrap_err(),
            LifecycleError::NotHost
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capacity_change_racing_joins_never_overfills() {
        for _ in 0..20 {
            let store = InMemoryMatchStore::new();
            let shared: Arc<dyn VersionedEntityStore> = Arc::new(store.clone());
            let clock = Arc::new(ManualClock::default());
            let config = CapacityConfig {
                max_attempts: 10,
                ..quick()
            };
            let hosting = MatchHosting::new(
                Arc::clone(&shared),
                quiet(),
                clock.clone(),
                LifecyclePolicy::default(),
                config.clone(),
            );
            let lifecycle = ParticipationLifecycle::new(
                Arc::clone(&shared),
                CapacityCoordinator::new(shared, config),
                quiet(),
                clock,
                LifecyclePolicy::default(),
            );
            let m = MatchBuilder::new().capacity(6).participants(4).build();
            store.seed_match(m.clone());

            let joins: Vec<_> = (0..2)
                .map(|_| {
                    let lifecycle = lifecycle.clone();
                    tokio::spawn(async move { lifecycle.create(m.id, UserId::new()).await })
                })
                .collect();
            let shrink = hosting.update_capacity(m.id, m.host_id, 4).await;
            let joined = futures::future::join_all(joins)
                .await
                .into_iter()
                .filter(|r| r.as_ref().unwrap().is_ok())
                .count();

            let after = store.match_snapshot(m.id).unwrap();
            assert!(after.current_participants <= after.max_participants);
            assert_eq!(after.current_participants as usize, 4 + joined);
            assert_eq!(after.status == MatchStatus::Full, after.current_participants == after.max_participants);
            match shrink {
                Ok(_) => {
                    assert_eq!(joined, 0);
                    assert_eq!(after.max_participants, 4);
                }
                Err(e) => {
                    assert!(matches!(
                        e,
                        LifecycleError::CapacityBelowParticipants { .. } | LifecycleError::CapacityConflict { .. }
                    ));
                    assert_eq!(after.max_participants, 6);
                }
            }
        }
    }
}

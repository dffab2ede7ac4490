//! Participation lifecycle: join, approve, reject, cancel, reactivate.
//!
//! Every operation runs through [`CapacityCoordinator::adjust`], which commits the
//! participation write and the match count update together. Preconditions that
//! depend on the match (joinability, start time, cancellation deadline, host
//! identity) are evaluated inside the plan, against the same snapshot whose version
//! the commit is checked against.

use crate::capacity::{CapacityCoordinator, CapacityPlan, ParticipationChange};
use crate::publisher::SearchEventPublisher;
use futures::future::BoxFuture;
use matchup_core::environment::Clock;
use matchup_core::ids::{MatchId, ParticipationId, UserId};
use matchup_core::matches::{Match, MatchStatus};
use matchup_core::participation::{Participation, ParticipationAction};
use matchup_core::policy::LifecyclePolicy;
use matchup_core::store::VersionedEntityStore;
use matchup_core::{DateTime, LifecycleError, Result, Utc};
use std::sync::Arc;

/// Request-driven participation transitions.
#[derive(Clone)]
pub struct ParticipationLifecycle {
    store: Arc<dyn VersionedEntityStore>,
    capacity: CapacityCoordinator,
    events: SearchEventPublisher,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
}

impl ParticipationLifecycle {
    /// Wire the lifecycle over shared collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn VersionedEntityStore>,
        capacity: CapacityCoordinator,
        events: SearchEventPublisher,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            store,
            capacity,
            events,
            clock,
            policy,
        }
    }

    /// Request to join a match. Takes a slot immediately.
    ///
    /// A previously cancelled row for the same user is reactivated instead of
    /// inserting a new one.
    ///
    /// # Errors
    ///
    /// `HostCannotParticipate`, `MatchFull`, `MatchNotJoinable`, `OverlappingParticipation`,
    /// `DuplicateParticipation`, `CapacityConflict`, or a store failure.
    #[tracing::instrument(skip(self), name = "create_participation")]
    pub async fn create(&self, match_id: MatchId, user_id: UserId) -> Result<Participation> {
        let target = self.load_match(match_id).await?;
        if target.is_host(user_id) {
            return Err(LifecycleError::HostCannotParticipate);
        }
        self.ensure_no_overlap(&target, user_id).await?;

        let store = Arc::clone(&self.store);
        let now = self.clock.now();
        let outcome = self
            .capacity
            .adjust(match_id, move |current: Match| -> BoxFuture<'static, Result<CapacityPlan>> {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    current.ensure_joinable()?;
                    if store.find_active_participation(match_id, user_id).await?.is_some() {
                        return Err(LifecycleError::DuplicateParticipation);
                    }
                    let change = match store.find_cancelled_participation(match_id, user_id).await? {
                        Some(cancelled) => ParticipationChange::Update(
                            cancelled.apply(ParticipationAction::Reactivate, now)?,
                        ),
                        None => ParticipationChange::Insert(Participation::pending(match_id, user_id, now)),
                    };
                    Ok(CapacityPlan {
                        change,
                        delta: ParticipationAction::Create.capacity_delta(),
                    })
                })
            })
            .await?;

        tracing::info!(
            match_id = %match_id,
            participation_id = %outcome.participation.id,
            participants = outcome.after.current_participants,
            "Participation created"
        );
        self.events.publish_transition(&outcome.before, &outcome.after);
        Ok(outcome.participation)
    }

    /// Host approves a pending request. The count is unchanged.
    ///
    /// # Errors
    ///
    /// `NotHost`, `ParticipationNotFound`, `InvalidStateTransition`, `CapacityConflict`.
    #[tracing::instrument(skip(self), name = "approve_participation")]
    pub async fn approve(
        &self,
        match_id: MatchId,
        participation_id: ParticipationId,
        host_id: UserId,
    ) -> Result<Participation> {
        self.host_decision(match_id, participation_id, host_id, ParticipationAction::Approve)
            .await
    }

    /// Host rejects a pending request, freeing its slot.
    ///
    /// # Errors
    ///
    /// `NotHost`, `ParticipationNotFound`, `InvalidStateTransition`, `CapacityConflict`.
    #[tracing::instrument(skip(self), name = "reject_participation")]
    pub async fn reject(
        &self,
        match_id: MatchId,
        participation_id: ParticipationId,
        host_id: UserId,
    ) -> Result<Participation> {
        self.host_decision(match_id, participation_id, host_id, ParticipationAction::Reject)
            .await
    }

    async fn host_decision(
        &self,
        match_id: MatchId,
        participation_id: ParticipationId,
        host_id: UserId,
        action: ParticipationAction,
    ) -> Result<Participation> {
        let store = Arc::clone(&self.store);
        let now = self.clock.now();
        let outcome = self
            .capacity
            .adjust(match_id, move |current: Match| -> BoxFuture<'static, Result<CapacityPlan>> {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    if !current.is_host(host_id) {
                        return Err(LifecycleError::NotHost);
                    }
                    let participation = load_participation(&*store, match_id, participation_id).await?;
                    Ok(CapacityPlan {
                        change: ParticipationChange::Update(participation.apply(action, now)?),
                        delta: action.capacity_delta(),
                    })
                })
            })
            .await?;

        tracing::info!(
            match_id = %match_id,
            participation_id = %participation_id,
            action = action.name(),
            participants = outcome.after.current_participants,
            "Host decision recorded"
        );
        self.events.publish_transition(&outcome.before, &outcome.after);
        Ok(outcome.participation)
    }

    /// Cancel a pending or confirmed participation, freeing its slot.
    ///
    /// Only the participant may cancel; a host removes a request with
    /// [`Self::reject`] or cancels the whole match. Cancellation is refused once the
    /// match is in progress or its start has passed, and inside the cancellation
    /// deadline before start.
    ///
    /// # Errors
    ///
    /// `NotParticipant`, `MatchAlreadyStarted`, `CancelWindowExceeded`,
    /// `InvalidStateTransition`, `ParticipationNotFound`, `CapacityConflict`.
    #[tracing::instrument(skip(self), name = "cancel_participation")]
    pub async fn cancel(
        &self,
        match_id: MatchId,
        participation_id: ParticipationId,
        user_id: UserId,
    ) -> Result<Participation> {
        let store = Arc::clone(&self.store);
        let now = self.clock.now();
        let deadline = self.policy.cancel_deadline;
        let outcome = self
            .capacity
            .adjust(match_id, move |current: Match| -> BoxFuture<'static, Result<CapacityPlan>> {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let participation = load_participation(&*store, match_id, participation_id).await?;
                    if participation.user_id != user_id {
                        return Err(LifecycleError::NotParticipant);
                    }
                    ensure_cancellable(&current, now, deadline)?;
                    Ok(CapacityPlan {
                        change: ParticipationChange::Update(
                            participation.apply(ParticipationAction::Cancel, now)?,
                        ),
                        delta: ParticipationAction::Cancel.capacity_delta(),
                    })
                })
            })
            .await?;

        tracing::info!(
            match_id = %match_id,
            participation_id = %participation_id,
            participants = outcome.after.current_participants,
            "Participation cancelled"
        );
        self.events.publish_transition(&outcome.before, &outcome.after);
        Ok(outcome.participation)
    }

    /// Participant reactivates a cancelled request, taking a slot again.
    ///
    /// # Errors
    ///
    /// `NotParticipant`, `MatchFull`, `MatchNotJoinable`, `OverlappingParticipation`,
    /// `InvalidStateTransition`, `DuplicateParticipation`, `CapacityConflict`.
    #[tracing::instrument(skip(self), name = "reactivate_participation")]
    pub async fn reactivate(
        &self,
        match_id: MatchId,
        participation_id: ParticipationId,
        user_id: UserId,
    ) -> Result<Participation> {
        let target = self.load_match(match_id).await?;
        self.ensure_no_overlap(&target, user_id).await?;

        let store = Arc::clone(&self.store);
        let now = self.clock.now();
        let outcome = self
            .capacity
            .adjust(match_id, move |current: Match| -> BoxFuture<'static, Result<CapacityPlan>> {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let participation = load_participation(&*store, match_id, participation_id).await?;
                    if participation.user_id != user_id {
                        return Err(LifecycleError::NotParticipant);
                    }
                    let reactivated = participation.apply(ParticipationAction::Reactivate, now)?;
                    current.ensure_joinable()?;
                    Ok(CapacityPlan {
                        change: ParticipationChange::Update(reactivated),
                        delta: ParticipationAction::Reactivate.capacity_delta(),
                    })
                })
            })
            .await?;

        tracing::info!(
            match_id = %match_id,
            participation_id = %participation_id,
            participants = outcome.after.current_participants,
            "Participation reactivated"
        );
        self.events.publish_transition(&outcome.before, &outcome.after);
        Ok(outcome.participation)
    }

    async fn load_match(&self, match_id: MatchId) -> Result<Match> {
        self.store
            .load_match(match_id)
            .await?
            .ok_or(LifecycleError::MatchNotFound(match_id))
    }

    async fn ensure_no_overlap(&self, target: &Match, user_id: UserId) -> Result<()> {
        let joined = self.store.active_matches_for_participant(user_id).await?;
        match joined
            .iter()
            .find(|m| m.id != target.id && m.schedule.overlaps(&target.schedule))
        {
            Some(clash) => Err(LifecycleError::OverlappingParticipation(clash.id)),
            None => Ok(()),
        }
    }
}

async fn load_participation(
    store: &dyn VersionedEntityStore,
    match_id: MatchId,
    participation_id: ParticipationId,
) -> Result<Participation> {
    store
        .load_participation(participation_id)
        .await?
        .filter(|p| p.match_id == match_id)
        .ok_or(LifecycleError::ParticipationNotFound(participation_id))
}

fn ensure_cancellable(current: &Match, now: DateTime<Utc>, deadline: chrono::Duration) -> Result<()> {
    if matches!(current.status, MatchStatus::InProgress | MatchStatus::Ended) || current.has_started(now) {
        return Err(LifecycleError::MatchAlreadyStarted(current.id));
    }
    if now > current.schedule.start_at() - deadline {
        return Err(LifecycleError::CancelWindowExceeded(current.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::capacity::CapacityConfig;
    use matchup_core::event::{MATCH_SEARCH_TOPIC, MatchSearchEvent};
    use matchup_core::participation::ParticipationStatus;
    use matchup_testing::fixtures::MatchBuilder;
    use matchup_testing::{InMemoryEventBus, InMemoryMatchStore, ManualClock, test_epoch};
    use std::time::Duration;

    struct Harness {
        store: InMemoryMatchStore,
        bus: InMemoryEventBus,
        events: SearchEventPublisher,
        clock: Arc<ManualClock>,
        lifecycle: ParticipationLifecycle,
    }

    fn harness() -> Harness {
        let store = InMemoryMatchStore::new();
        let bus = InMemoryEventBus::new();
        let clock = Arc::new(ManualClock::default());
        let shared: Arc<dyn VersionedEntityStore> = Arc::new(store.clone());
        let capacity = CapacityCoordinator::new(
            Arc::clone(&shared),
            CapacityConfig {
                max_attempts: 4,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
        );
        let events = SearchEventPublisher::new(Arc::new(bus.clone()));
        let lifecycle = ParticipationLifecycle::new(
            shared,
            capacity,
            events.clone(),
            clock.clone(),
            LifecyclePolicy::default(),
        );
        Harness {
            store,
            bus,
            events,
            clock,
            lifecycle,
        }
    }

    #[tokio::test]
    async fn join_creates_pending_and_takes_a_slot() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());

        let p = h.lifecycle.create(m.id, UserId::new()).await.unwrap();

        assert_eq!(p.status, ParticipationStatus::Pending);
        assert_eq!(h.store.match_snapshot(m.id).unwrap().current_participants, 2);
    }

    #[tokio::test]
    async fn host_cannot_join_own_match() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());

        let err = h.lifecycle.create(m.id, m.host_id).await.unwrap_err();
        assert_eq!(err, LifecycleError::HostCannotParticipate);
    }

    #[tokio::test]
    async fn second_join_by_same_user_is_duplicate() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let user = UserId::new();

        h.lifecycle.create(m.id, user).await.unwrap();
        let err = h.lifecycle.create(m.id, user).await.unwrap_err();

        assert_eq!(err, LifecycleError::DuplicateParticipation);
        assert_eq!(h.store.match_snapshot(m.id).unwrap().current_participants, 2);
    }

    #[tokio::test]
    async fn overlapping_match_blocks_join() {
        let h = harness();
        let first = MatchBuilder::new().build();
        let second = MatchBuilder::new()
            .starting_at(first.schedule.start_at() + chrono::Duration::hours(1))
            .build();
        h.store.seed_match(first.clone());
        h.store.seed_match(second.clone());
        let user = UserId::new();

        h.lifecycle.create(first.id, user).await.unwrap();
        let err = h.lifecycle.create(second.id, user).await.unwrap_err();

        assert_eq!(err, LifecycleError::OverlappingParticipation(first.id));
    }

    #[tokio::test]
    async fn cancelled_row_is_reused_on_rejoin() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let user = UserId::new();

        let first = h.lifecycle.create(m.id, user).await.unwrap();
        h.lifecycle.cancel(m.id, first.id, user).await.unwrap();
        let again = h.lifecycle.create(m.id, user).await.unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.status, ParticipationStatus::Pending);
        assert_eq!(h.store.participations_for(m.id).len(), 1);
        assert_eq!(h.store.match_snapshot(m.id).unwrap().current_participants, 2);
    }

    #[tokio::test]
    async fn approve_keeps_count_but_bumps_match_version() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let p = h.lifecycle.create(m.id, UserId::new()).await.unwrap();
        let before = h.store.match_snapshot(m.id).unwrap();

        let approved = h.lifecycle.approve(m.id, p.id, m.host_id).await.unwrap();

        let after = h.store.match_snapshot(m.id).unwrap();
        assert_eq!(approved.status, ParticipationStatus::Confirmed);
        assert_eq!(after.current_participants, before.current_participants);
        assert_eq!(after.version, before.version.next());
    }

    #[tokio::test]
    async fn only_host_decides() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let user = UserId::new();
        let p = h.lifecycle.create(m.id, user).await.unwrap();

        assert_eq!(
            h.lifecycle.approve(m.id, p.id, user).await.unwrap_err(),
            LifecycleError::NotHost
        );
        assert_eq!(
            h.lifecycle.reject(m.id, p.id, UserId::new()).await.unwrap_err(),
            LifecycleError::NotHost
        );
    }

    #[tokio::test]
    async fn reject_frees_the_slot_and_reopens_a_full_match() {
        let h = harness();
        let m = MatchBuilder::new().capacity(4).participants(3).build();
        h.store.seed_match(m.clone());
        let p = h.lifecycle.create(m.id, UserId::new()).await.unwrap();
        assert_eq!(h.store.match_snapshot(m.id).unwrap().status, MatchStatus::Full);

        let rejected = h.lifecycle.reject(m.id, p.id, m.host_id).await.unwrap();

        let after = h.store.match_snapshot(m.id).unwrap();
        assert_eq!(rejected.status, ParticipationStatus::Rejected);
        assert_eq!(after.current_participants, 3);
        assert_eq!(after.status, MatchStatus::Pending);

        h.events.flush().await;
        let events: Vec<_> = h
            .bus
            .published(MATCH_SEARCH_TOPIC)
            .iter()
            .map(|e| MatchSearchEvent::decode(e).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                MatchSearchEvent::left_search_index(m.id),
                MatchSearchEvent::became_searchable(&after),
            ]
        );
    }

    #[tokio::test]
    async fn rejected_request_cannot_be_approved() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let p = h.lifecycle.create(m.id, UserId::new()).await.unwrap();
        h.lifecycle.reject(m.id, p.id, m.host_id).await.unwrap();

        let err = h.lifecycle.approve(m.id, p.id, m.host_id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_inside_deadline_is_refused() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let user = UserId::new();
        let p = h.lifecycle.create(m.id, user).await.unwrap();

        h.clock.set(m.schedule.start_at() - chrono::Duration::minutes(90));
        let err = h.lifecycle.cancel(m.id, p.id, user).await.unwrap_err();

        assert_eq!(err, LifecycleError::CancelWindowExceeded(m.id));
        assert_eq!(h.store.match_snapshot(m.id).unwrap().current_participants, 2);
    }

    #[tokio::test]
    async fn only_the_participant_can_cancel() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let user = UserId::new();
        let p = h.lifecycle.create(m.id, user).await.unwrap();

        assert_eq!(
            h.lifecycle.cancel(m.id, p.id, UserId::new()).await.unwrap_err(),
            LifecycleError::NotParticipant
        );
        assert_eq!(
            h.lifecycle.cancel(m.id, p.id, m.host_id).await.unwrap_err(),
            LifecycleError::NotParticipant
        );
        assert_eq!(h.store.match_snapshot(m.id).unwrap().current_participants, 2);

        let cancelled = h.lifecycle.cancel(m.id, p.id, user).await.unwrap();
        assert_eq!(cancelled.status, ParticipationStatus::Cancelled);
    }

    #[tokio::test]
    async fn slow_broker_does_not_hold_the_write_path() {
        let h = harness();
        h.bus.set_latency(Duration::from_secs(1));
        h.bus.set_failing(true);
        let m = MatchBuilder::new().capacity(4).participants(3).build();
        h.store.seed_match(m.clone());
        let user = UserId::new();

        let started = tokio::time::Instant::now();
        let p = h.lifecycle.create(m.id, user).await.unwrap();
        h.lifecycle.cancel(m.id, p.id, user).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(h.store.match_snapshot(m.id).unwrap().current_participants, 3);
    }

    #[tokio::test]
    async fn reactivate_takes_a_slot_again() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        let user = UserId::new();
        let p = h.lifecycle.create(m.id, user).await.unwrap();
        h.lifecycle.cancel(m.id, p.id, user).await.unwrap();
        h.clock.set(test_epoch() + chrono::Duration::hours(1));

        let again = h.lifecycle.reactivate(m.id, p.id, user).await.unwrap();

        assert_eq!(again.status, ParticipationStatus::Pending);
        assert_eq!(again.joined_at, test_epoch() + chrono::Duration::hours(1));
        assert_eq!(h.store.match_snapshot(m.id).unwrap().current_participants, 2);
    }

    #[tokio::test]
    async fn participation_from_another_match_is_not_found() {
        let h = harness();
        let a = MatchBuilder::new().build();
        let b = MatchBuilder::new().build();
        h.store.seed_match(a.clone());
        h.store.seed_match(b.clone());
        let p = h.lifecycle.create(a.id, UserId::new()).await.unwrap();

        let err = h.lifecycle.approve(b.id, p.id, b.host_id).await.unwrap_err();
        assert_eq!(err, LifecycleError::ParticipationNotFound(p.id));
    }
}

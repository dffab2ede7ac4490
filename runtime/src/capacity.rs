//! Capacity coordination.
//!
//! [`CapacityCoordinator`] is the only writer of `Match::current_participants`. Each
//! adjustment reads a fresh match snapshot, asks the caller for a [`CapacityPlan`]
//! against that snapshot, and commits the participation write together with the
//! match update in one [`WriteBatch`]. A version conflict restarts the whole cycle,
//! so business preconditions are re-checked on every attempt: racing joiners on the
//! last slot see `MatchFull` once the winner has committed, not a conflict.

use crate::metrics::CapacityMetrics;
use crate::retry::{Jitter, RetryPolicy};
use futures::future::BoxFuture;
use matchup_core::event::MatchSearchEvent;
use matchup_core::ids::MatchId;
use matchup_core::matches::Match;
use matchup_core::participation::Participation;
use matchup_core::store::{
    VersionedEntityStore, VersionedWrite, WriteBatch, committed_match, committed_participation,
};
use matchup_core::{LifecycleError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Retry budget for compare-and-set attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityConfig {
    /// Total attempts, including the first
    pub max_attempts: usize,
    /// Base backoff before the first retry
    pub base_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl CapacityConfig {
    /// Backoff policy derived from this config, always fully jittered.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .initial_delay(self.base_backoff)
            .max_delay(self.max_backoff)
            .jitter(Jitter::Full)
            .build()
    }
}

/// The participation side of an adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipationChange {
    /// New row; must not collide with an active one for the same user and match
    Insert(Participation),
    /// Existing row, compare-and-set on its version
    Update(Participation),
}

impl ParticipationChange {
    fn into_write(self) -> VersionedWrite {
        match self {
            Self::Insert(p) => VersionedWrite::InsertParticipation(p),
            Self::Update(p) => VersionedWrite::UpdateParticipation(p),
        }
    }

    fn committed(&self) -> Participation {
        match self {
            Self::Insert(p) => committed_participation(p.clone(), true),
            Self::Update(p) => committed_participation(p.clone(), false),
        }
    }
}

/// What one attempt wants to write: a participation change and the count delta it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPlan {
    /// Participation write
    pub change: ParticipationChange,
    /// Signed change to `current_participants`
    pub delta: i32,
}

/// Result of a committed adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityOutcome {
    /// Snapshot the winning attempt was planned against
    pub before: Match,
    /// Match as stored after commit
    pub after: Match,
    /// Participation as stored after commit
    pub participation: Participation,
    /// Attempts used, at least one
    pub attempts: usize,
}

impl CapacityOutcome {
    /// Index event implied by the change, if searchability flipped.
    #[must_use]
    pub fn search_event(&self) -> Option<MatchSearchEvent> {
        MatchSearchEvent::for_transition(&self.before, &self.after)
    }
}

/// Read-validate-write loop over the versioned store.
#[derive(Clone)]
pub struct CapacityCoordinator {
    store: Arc<dyn VersionedEntityStore>,
    config: CapacityConfig,
}

impl CapacityCoordinator {
    /// Create a coordinator writing through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn VersionedEntityStore>, config: CapacityConfig) -> Self {
        Self { store, config }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CapacityConfig {
        &self.config
    }

    /// Adjust capacity for `match_id`.
    ///
    /// `plan` runs once per attempt against the snapshot just read and may perform
    /// its own reads; it must be side-effect free because a conflict discards it.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::MatchNotFound`] if the match does not exist
    /// - any business error returned by `plan` or by the count update
    /// - [`LifecycleError::DuplicateParticipation`] if the store rejects a second active row
    /// - [`LifecycleError::CapacityConflict`] after `max_attempts` version conflicts
    /// - [`LifecycleError::Store`] on infrastructure failure
    pub async fn adjust<F>(&self, match_id: MatchId, mut plan: F) -> Result<CapacityOutcome>
    where
        F: FnMut(Match) -> BoxFuture<'static, Result<CapacityPlan>> + Send,
    {
        let policy = self.config.retry_policy();
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let before = self
                .store
                .load_match(match_id)
                .await?
                .ok_or(LifecycleError::MatchNotFound(match_id))?;

            let CapacityPlan { change, delta } = plan(before.clone()).await?;
            let updated = before.with_participant_delta(delta)?;
            let participation = change.committed();

            let batch = WriteBatch::new()
                .with(change.into_write())
                .with(VersionedWrite::UpdateMatch(updated.clone()));

            match self.store.commit(batch).await {
                Ok(()) => {
                    CapacityMetrics::record_commit(started.elapsed());
                    tracing::debug!(
                        match_id = %match_id,
                        attempt,
                        delta,
                        participants = updated.current_participants,
                        status = %updated.status,
                        "Capacity adjusted"
                    );
                    return Ok(CapacityOutcome {
                        before,
                        after: committed_match(updated),
                        participation,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_version_conflict() => {
                    if attempt >= policy.max_attempts() {
                        CapacityMetrics::record_exhausted();
                        tracing::error!(
                            match_id = %match_id,
                            attempts = attempt,
                            "Capacity adjustment exhausted its retry budget"
                        );
                        return Err(LifecycleError::CapacityConflict {
                            match_id,
                            attempts: attempt,
                        });
                    }

                    CapacityMetrics::record_retried_conflict();
                    let delay = policy.jittered_delay(attempt - 1);
                    tracing::warn!(
                        match_id = %match_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Version conflict, retrying capacity adjustment"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

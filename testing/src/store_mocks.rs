//! In-memory authoritative store.
//!
//! [`InMemoryMatchStore`] implements the same compare-and-set and uniqueness rules as
//! the Postgres store, under a single mutex so each batch is atomic. Reads yield to
//! the scheduler first, which lets concurrent tasks interleave between read and write
//! the way separate service instances would.

use matchup_core::ids::{MatchId, ParticipationId, UserId};
use matchup_core::matches::{Match, MatchStatus};
use matchup_core::participation::{Participation, ParticipationStatus};
use matchup_core::store::{
    EntityKind, MatchScan, StoreError, StoreFuture, VersionedEntityStore, VersionedWrite,
    WriteBatch,
};
use matchup_core::{DateTime, Utc, Version};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug, Default)]
struct Tables {
    matches: HashMap<MatchId, Match>,
    participations: HashMap<ParticipationId, Participation>,
}

impl Tables {
    fn has_other_active(&self, candidate: &Participation) -> bool {
        self.participations.values().any(|p| {
            p.id != candidate.id
                && p.match_id == candidate.match_id
                && p.user_id == candidate.user_id
                && p.is_active()
        })
    }

    fn apply(&mut self, write: VersionedWrite) -> Result<(), StoreError> {
        match write {
            VersionedWrite::InsertMatch(m) => {
                if self.matches.contains_key(&m.id) {
                    return Err(StoreError::AlreadyExists {
                        entity: EntityKind::Match,
                        id: m.id.to_string(),
                    });
                }
                let mut stored = m;
                stored.version = Version::INITIAL;
                self.matches.insert(stored.id, stored);
            }
            VersionedWrite::UpdateMatch(m) => {
                let actual = self.matches.get(&m.id).map(|s| s.version);
                if actual != Some(m.version) {
                    return Err(StoreError::VersionConflict {
                        entity: EntityKind::Match,
                        id: m.id.to_string(),
                        expected: m.version,
                        actual,
                    });
                }
                let mut stored = m;
                stored.version = stored.version.next();
                self.matches.insert(stored.id, stored);
            }
            VersionedWrite::InsertParticipation(p) => {
                if self.participations.contains_key(&p.id) {
                    return Err(StoreError::AlreadyExists {
                        entity: EntityKind::Participation,
                        id: p.id.to_string(),
                    });
                }
                if p.is_active() && self.has_other_active(&p) {
                    return Err(StoreError::DuplicateParticipation);
                }
                let mut stored = p;
                stored.version = Version::INITIAL;
                self.participations.insert(stored.id, stored);
            }
            VersionedWrite::UpdateParticipation(p) => {
                let actual = self.participations.get(&p.id).map(|s| s.version);
                if actual != Some(p.version) {
                    return Err(StoreError::VersionConflict {
                        entity: EntityKind::Participation,
                        id: p.id.to_string(),
                        expected: p.version,
                        actual,
                    });
                }
                if p.is_active() && self.has_other_active(&p) {
                    return Err(StoreError::DuplicateParticipation);
                }
                let mut stored = p;
                stored.version = stored.version.next();
                self.participations.insert(stored.id, stored);
            }
        }
        Ok(())
    }
}

/// In-memory [`VersionedEntityStore`] and [`MatchScan`].
///
/// # Example
///
/// ```ignore
/// let store = InMemoryMatchStore::new();
/// store.seed_match(fixtures::MatchBuilder::new().capacity(4).build());
/// store.inject_conflicts(2); // next two commits fail with VersionConflict
/// store.fail_commits_for(match_id); // commits touching match_id fail with Database
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryMatchStore {
    tables: Arc<Mutex<Tables>>,
    injected_conflicts: Arc<AtomicUsize>,
    broken_matches: Arc<Mutex<HashSet<MatchId>>>,
    commits: Arc<AtomicUsize>,
}

impl InMemoryMatchStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a match in place as-is, bypassing version checks.
    pub fn seed_match(&self, m: Match) {
        self.tables().matches.insert(m.id, m);
    }

    /// Put a participation in place as-is, bypassing version checks.
    pub fn seed_participation(&self, p: Participation) {
        self.tables().participations.insert(p.id, p);
    }

    /// Current stored match.
    #[must_use]
    pub fn match_snapshot(&self, id: MatchId) -> Option<Match> {
        self.tables().matches.get(&id).cloned()
    }

    /// Every participation of a match.
    #[must_use]
    pub fn participations_for(&self, match_id: MatchId) -> Vec<Participation> {
        let mut rows: Vec<_> = self
            .tables()
            .participations
            .values()
            .filter(|p| p.match_id == match_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.joined_at);
        rows
    }

    /// Make the next `n` commits fail with a version conflict, as if another writer won.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Fail every commit that writes `match_id` (or one of its participations) with
    /// [`StoreError::Database`] until [`Self::restore_commits_for`] is called.
    pub fn fail_commits_for(&self, match_id: MatchId) {
        self.broken().insert(match_id);
    }

    /// Undo [`Self::fail_commits_for`].
    pub fn restore_commits_for(&self, match_id: MatchId) {
        self.broken().remove(&match_id);
    }

    fn broken(&self) -> MutexGuard<'_, HashSet<MatchId>> {
        self.broken_matches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touches_broken_match(&self, batch: &WriteBatch) -> Option<MatchId> {
        let broken = self.broken();
        batch
            .writes()
            .iter()
            .map(|write| match write {
                VersionedWrite::UpdateMatch(m) | VersionedWrite::InsertMatch(m) => m.id,
                VersionedWrite::UpdateParticipation(p) | VersionedWrite::InsertParticipation(p) => {
                    p.match_id
                }
            })
            .find(|id| broken.contains(id))
    }

    /// Number of commits that succeeded.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn non_terminal(status: MatchStatus) -> bool {
        !matches!(status, MatchStatus::Ended | MatchStatus::Cancelled)
    }
}

impl VersionedEntityStore for InMemoryMatchStore {
    fn load_match(&self, id: MatchId) -> StoreFuture<'_, Option<Match>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(self.match_snapshot(id))
        })
    }

    fn load_participation(&self, id: ParticipationId) -> StoreFuture<'_, Option<Participation>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(self.tables().participations.get(&id).cloned())
        })
    }

    fn find_active_participation(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> StoreFuture<'_, Option<Participation>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(self
                .tables()
                .participations
                .values()
                .find(|p| p.match_id == match_id && p.user_id == user_id && p.is_active())
                .cloned())
        })
    }

    fn find_cancelled_participation(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> StoreFuture<'_, Option<Participation>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(self
                .tables()
                .participations
                .values()
                .filter(|p| {
                    p.match_id == match_id
                        && p.user_id == user_id
                        && p.status == ParticipationStatus::Cancelled
                })
                .max_by_key(|p| p.joined_at)
                .cloned())
        })
    }

    fn active_matches_for_participant(&self, user_id: UserId) -> StoreFuture<'_, Vec<Match>> {
        Box::pin(async move {
            let tables = self.tables();
            Ok(tables
                .participations
                .values()
                .filter(|p| p.user_id == user_id && p.is_active())
                .filter_map(|p| tables.matches.get(&p.match_id))
                .filter(|m| Self::non_terminal(m.status))
                .cloned()
                .collect())
        })
    }

    fn active_matches_for_host(&self, host_id: UserId) -> StoreFuture<'_, Vec<Match>> {
        Box::pin(async move {
            Ok(self
                .tables()
                .matches
                .values()
                .filter(|m| m.host_id == host_id && Self::non_terminal(m.status))
                .cloned()
                .collect())
        })
    }

    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            if let Some(match_id) = self.touches_broken_match(&batch) {
                return Err(StoreError::Database(format!("simulated outage writing match {match_id}")));
            }
            let mut tables = self.tables();

            if self.take_injected_conflict() {
                let (entity, id, expected) = match batch.writes().first() {
                    Some(VersionedWrite::UpdateMatch(m) | VersionedWrite::InsertMatch(m)) => {
                        (EntityKind::Match, m.id.to_string(), m.version)
                    }
                    Some(
                        VersionedWrite::UpdateParticipation(p)
                        | VersionedWrite::InsertParticipation(p),
                    ) => (EntityKind::Participation, p.id.to_string(), p.version),
                    None => (EntityKind::Match, String::new(), Version::INITIAL),
                };
                return Err(StoreError::VersionConflict {
                    entity,
                    id,
                    expected,
                    actual: Some(expected.next()),
                });
            }

            let mut staged = tables.clone();
            for write in batch.into_writes() {
                staged.apply(write)?;
            }
            *tables = staged;
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl MatchScan for InMemoryMatchStore {
    fn matches_due_to_start(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MatchId>> {
        Box::pin(async move {
            let tables = self.tables();
            let mut due: Vec<&Match> = tables
                .matches
                .values()
                .filter(|m| m.status.can_start() && m.has_started(now))
                .collect();
            due.sort_by_key(|m| m.schedule.start_at());
            Ok(due.into_iter().take(limit).map(|m| m.id).collect())
        })
    }

    fn matches_due_to_end(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MatchId>> {
        Box::pin(async move {
            let tables = self.tables();
            let mut due: Vec<&Match> = tables
                .matches
                .values()
                .filter(|m| m.status.can_end() && m.has_ended(now))
                .collect();
            due.sort_by_key(|m| m.schedule.end_at());
            Ok(due.into_iter().take(limit).map(|m| m.id).collect())
        })
    }

    fn searchable_match_ids(&self) -> StoreFuture<'_, Vec<MatchId>> {
        Box::pin(async move {
            let mut ids: Vec<MatchId> = self
                .tables()
                .matches
                .values()
                .filter(|m| m.is_searchable())
                .map(|m| m.id)
                .collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn load_matches(&self, ids: Vec<MatchId>) -> StoreFuture<'_, Vec<Match>> {
        Box::pin(async move {
            let tables = self.tables();
            Ok(ids
                .iter()
                .filter_map(|id| tables.matches.get(id).cloned())
                .collect())
        })
    }
}

//! Time-driven match lifecycle advancement.
//!
//! Every instance runs [`MatchLifecycleScheduler::run`], but each pass first takes a
//! named [`DistributedLock`]; instances that lose the race skip the pass. Inside a
//! pass every match is re-read and written with compare-and-set, so a pass that
//! overlaps a user cancellation (or a second pass after lock expiry) can only turn
//! into "nothing to do".

use crate::metrics::SchedulerMetrics;
use crate::publisher::SearchEventPublisher;
use matchup_core::environment::Clock;
use matchup_core::ids::MatchId;
use matchup_core::lock::{DistributedLock, LockError, LockRequest};
use matchup_core::matches::{Match, MatchStatus};
use matchup_core::store::{MatchScan, StoreError, VersionedEntityStore, VersionedWrite, WriteBatch, committed_match};
use matchup_core::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Errors that abort a whole pass. Per-match failures never do.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Lock backend failed
    #[error("Scheduler lock error: {0}")]
    Lock(#[from] LockError),

    /// Scanning for due matches failed
    #[error("Scheduler scan failed: {0}")]
    Scan(#[from] StoreError),
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between passes
    pub interval: Duration,
    /// Lock name shared by every instance
    pub lock_name: String,
    /// Lease expiry; bounds how long a crashed holder stalls the cluster
    pub lock_at_most: Duration,
    /// Minimum hold; stops a fast instance from re-running the pass right away
    pub lock_at_least: Duration,
    /// Matches scanned per phase per pass
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lock_name: "match-lifecycle".to_string(),
            lock_at_most: Duration::from_secs(300),
            lock_at_least: Duration::from_secs(50),
            batch_size: 500,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Lock was held elsewhere; nothing ran
    pub skipped: bool,
    /// Matches moved to `InProgress`
    pub started: usize,
    /// Matches moved to `Ended`
    pub ended: usize,
    /// Lost compare-and-set races
    pub conflicts: usize,
    /// Matches that were no longer eligible when re-read
    pub not_eligible: usize,
    /// Matches whose write failed for another reason
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    End,
}

impl Phase {
    fn is_due(self, m: &Match, now: DateTime<Utc>) -> bool {
        match self {
            Self::Start => m.status.can_start() && m.has_started(now),
            Self::End => m.status.can_end() && m.has_ended(now),
        }
    }

    fn apply(self, m: &Match) -> matchup_core::Result<Match> {
        match self {
            Self::Start => m.start(),
            Self::End => m.end(),
        }
    }

    const fn target(self) -> MatchStatus {
        match self {
            Self::Start => MatchStatus::InProgress,
            Self::End => MatchStatus::Ended,
        }
    }
}

enum Step {
    Applied,
    NotEligible,
    Conflict,
    Failed,
}

/// Cluster-safe start/end scheduler.
#[derive(Clone)]
pub struct MatchLifecycleScheduler {
    store: Arc<dyn VersionedEntityStore>,
    scan: Arc<dyn MatchScan>,
    lock: Arc<dyn DistributedLock>,
    events: SearchEventPublisher,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl MatchLifecycleScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn VersionedEntityStore>,
        scan: Arc<dyn MatchScan>,
        lock: Arc<dyn DistributedLock>,
        events: SearchEventPublisher,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            scan,
            lock,
            events,
            clock,
            config,
        }
    }

    /// Run one pass: take the lock, start due matches, end due matches, release.
    ///
    /// # Errors
    ///
    /// [`SchedulerError`] if the lock backend or the scan fails. Individual match
    /// failures are counted in the report instead.
    pub async fn run_pass(&self) -> Result<PassReport, SchedulerError> {
        let request = LockRequest::new(
            self.config.lock_name.clone(),
            self.config.lock_at_most,
            self.config.lock_at_least,
        );
        let Some(lease) = self.lock.try_acquire(request).await? else {
            SchedulerMetrics::record_skipped();
            tracing::debug!(lock = %self.config.lock_name, "Lifecycle pass skipped, lock held elsewhere");
            return Ok(PassReport {
                skipped: true,
                ..PassReport::default()
            });
        };

        let started_at = Instant::now();
        let result = self.pass().await;

        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(error = %e, "Failed to release lifecycle lock; it will expire");
        }

        match &result {
            Ok(report) => {
                SchedulerMetrics::record_pass("completed", started_at.elapsed());
                if report.started + report.ended + report.conflicts + report.failures > 0 {
                    tracing::info!(
                        started = report.started,
                        ended = report.ended,
                        conflicts = report.conflicts,
                        failures = report.failures,
                        "Lifecycle pass finished"
                    );
                }
            }
            Err(e) => {
                SchedulerMetrics::record_pass("failed", started_at.elapsed());
                tracing::error!(error = %e, "Lifecycle pass failed");
            }
        }
        result
    }

    async fn pass(&self) -> Result<PassReport, SchedulerError> {
        let mut report = PassReport::default();
        let now = self.clock.now();

        let due = self.scan.matches_due_to_start(now, self.config.batch_size).await?;
        self.advance_all(Phase::Start, due, now, &mut report).await;

        let due = self.scan.matches_due_to_end(now, self.config.batch_size).await?;
        self.advance_all(Phase::End, due, now, &mut report).await;

        Ok(report)
    }

    async fn advance_all(&self, phase: Phase, due: Vec<MatchId>, now: DateTime<Utc>, report: &mut PassReport) {
        if due.len() >= self.config.batch_size {
            tracing::info!(?phase, batch = due.len(), "Batch limit reached, remainder runs next pass");
        }
        for match_id in due {
            match self.advance(phase, match_id, now).await {
                Step::Applied => match phase {
                    Phase::Start => report.started += 1,
                    Phase::End => report.ended += 1,
                },
                Step::NotEligible => report.not_eligible += 1,
                Step::Conflict => report.conflicts += 1,
                Step::Failed => report.failures += 1,
            }
        }
    }

    async fn advance(&self, phase: Phase, match_id: MatchId, now: DateTime<Utc>) -> Step {
        let before = match self.store.load_match(match_id).await {
            Ok(Some(m)) => m,
            Ok(None) => return Step::NotEligible,
            Err(e) => {
                tracing::warn!(match_id = %match_id, error = %e, "Failed to load match");
                return Step::Failed;
            }
        };
        if !phase.is_due(&before, now) {
            return Step::NotEligible;
        }
        let Ok(after) = phase.apply(&before) else {
            return Step::NotEligible;
        };

        match self
            .store
            .commit(WriteBatch::new().with(VersionedWrite::UpdateMatch(after.clone())))
            .await
        {
            Ok(()) => {
                SchedulerMetrics::record_transition(phase.target().as_str());
                tracing::debug!(match_id = %match_id, from = %before.status, to = %after.status, "Match advanced");
                self.events.publish_transition(&before, &committed_match(after));
                Step::Applied
            }
            Err(e) if e.is_version_conflict() => {
                tracing::debug!(match_id = %match_id, "Match changed concurrently, leaving for next pass");
                Step::Conflict
            }
            Err(e) => {
                tracing::warn!(match_id = %match_id, error = %e, "Failed to advance match");
                Step::Failed
            }
        }
    }

    /// Run passes every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            lock = %self.config.lock_name,
            "Starting lifecycle scheduler"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    // Failures are logged inside; the next tick retries.
                    let _ = self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Lifecycle scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use matchup_core::event::{MATCH_SEARCH_TOPIC, MatchSearchEvent};
    use matchup_testing::fixtures::MatchBuilder;
    use matchup_testing::{InMemoryEventBus, InMemoryLock, InMemoryMatchStore, ManualClock};

    struct Harness {
        store: InMemoryMatchStore,
        bus: InMemoryEventBus,
        events: SearchEventPublisher,
        clock: Arc<ManualClock>,
        lock: InMemoryLock,
        scheduler: MatchLifecycleScheduler,
    }

    fn harness() -> Harness {
        let store = InMemoryMatchStore::new();
        let bus = InMemoryEventBus::new();
        let clock = Arc::new(ManualClock::default());
        let lock = InMemoryLock::new(clock.clone());
        let events = SearchEventPublisher::new(Arc::new(bus.clone()));
        let scheduler = MatchLifecycleScheduler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(lock.clone()),
            events.clone(),
            clock.clone(),
            SchedulerConfig::default(),
        );
        Harness {
            store,
            bus,
            events,
            clock,
            lock,
            scheduler,
        }
    }

    #[tokio::test]
    async fn due_match_starts_and_leaves_the_index() {
        let h = harness();
        let m = MatchBuilder::new().status(MatchStatus::Confirmed).build();
        h.store.seed_match(m.clone());
        h.clock.set(m.schedule.start_at() + chrono::Duration::minutes(1));

        let report = h.scheduler.run_pass().await.unwrap();

        assert_eq!(report.started, 1);
        assert_eq!(h.store.match_snapshot(m.id).unwrap().status, MatchStatus::InProgress);
        h.events.flush().await;
        let published = h.bus.published(MATCH_SEARCH_TOPIC);
        assert_eq!(
            MatchSearchEvent::decode(&published[0]).unwrap(),
            MatchSearchEvent::left_search_index(m.id)
        );
    }

    #[tokio::test]
    async fn full_match_starts_without_an_index_event() {
        let h = harness();
        let m = MatchBuilder::new().participants(4).status(MatchStatus::Full).build();
        h.store.seed_match(m.clone());
        h.clock.set(m.schedule.start_at());
        h.clock.advance(chrono::Duration::seconds(1));

        h.scheduler.run_pass().await.unwrap();
        h.events.flush().await;

        assert_eq!(h.store.match_snapshot(m.id).unwrap().status, MatchStatus::InProgress);
        assert!(h.bus.published(MATCH_SEARCH_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn long_overdue_match_starts_and_ends_in_one_pass() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        h.clock.set(m.schedule.end_at() + chrono::Duration::minutes(5));

        let report = h.scheduler.run_pass().await.unwrap();

        assert_eq!((report.started, report.ended), (1, 1));
        assert_eq!(h.store.match_snapshot(m.id).unwrap().status, MatchStatus::Ended);
    }

    #[tokio::test]
    async fn cancelled_and_future_matches_are_left_alone() {
        let h = harness();
        let cancelled = MatchBuilder::new().cancelled(h.clock.now()).build();
        let future = MatchBuilder::new()
            .starting_at(MatchBuilder::new().build().schedule.start_at() + chrono::Duration::days(1))
            .build();
        h.store.seed_match(cancelled.clone());
        h.store.seed_match(future.clone());
        h.clock.set(cancelled.schedule.end_at() + chrono::Duration::minutes(1));

        let report = h.scheduler.run_pass().await.unwrap();

        assert_eq!(report, PassReport::default());
        assert_eq!(h.store.match_snapshot(cancelled.id).unwrap(), cancelled);
        assert_eq!(h.store.match_snapshot(future.id).unwrap(), future);
    }

    #[tokio::test]
    async fn held_lock_skips_the_pass() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        h.clock.set(m.schedule.start_at() + chrono::Duration::minutes(1));
        let _other = h
            .lock
            .try_acquire(LockRequest::new(
                "match-lifecycle",
                Duration::from_secs(300),
                Duration::from_secs(50),
            ))
            .await
            .unwrap()
            .unwrap();

        let report = h.scheduler.run_pass().await.unwrap();

        assert!(report.skipped);
        assert_eq!(h.store.match_snapshot(m.id).unwrap().status, MatchStatus::Pending);
    }

    #[tokio::test]
    async fn conflict_is_counted_and_retried_next_pass() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        h.clock.set(m.schedule.start_at() + chrono::Duration::minutes(1));
        h.store.inject_conflicts(1);

        let first = h.scheduler.run_pass().await.unwrap();
        assert_eq!(first.conflicts, 1);
        assert_eq!(h.store.match_snapshot(m.id).unwrap().status, MatchStatus::Pending);

        h.clock.advance(chrono::Duration::seconds(60));
        let second = h.scheduler.run_pass().await.unwrap();
        assert_eq!(second.started, 1);
    }

    /// Three matches that started 30, 20 and 10 minutes before the returned instant.
    fn staggered_due_matches(h: &Harness) -> (Vec<Match>, DateTime<Utc>) {
        let first = MatchBuilder::new().build();
        let matches: Vec<Match> = (0..3)
            .map(|i| {
                MatchBuilder::new()
                    .starting_at(first.schedule.start_at() + chrono::Duration::minutes(10 * i))
                    .build()
            })
            .collect();
        for m in &matches {
            h.store.seed_match(m.clone());
        }
        (matches, first.schedule.start_at() + chrono::Duration::minutes(30))
    }

    fn status_of(h: &Harness, m: &Match) -> MatchStatus {
        h.store.match_snapshot(m.id).unwrap().status
    }

    #[tokio::test]
    async fn failed_write_does_not_abort_the_batch() {
        let h = harness();
        let (due, now) = staggered_due_matches(&h);
        h.clock.set(now);
        h.store.fail_commits_for(due[1].id);

        let first = h.scheduler.run_pass().await.unwrap();

        assert_eq!((first.started, first.failures), (2, 1));
        assert_eq!(status_of(&h, &due[0]), MatchStatus::InProgress);
        assert_eq!(status_of(&h, &due[1]), MatchStatus::Pending);
        assert_eq!(status_of(&h, &due[2]), MatchStatus::InProgress);

        h.store.restore_commits_for(due[1].id);
        h.clock.advance(chrono::Duration::seconds(60));
        let second = h.scheduler.run_pass().await.unwrap();

        assert_eq!((second.started, second.failures), (1, 0));
        assert_eq!(status_of(&h, &due[1]), MatchStatus::InProgress);
    }

    #[tokio::test]
    async fn conflict_on_one_match_leaves_the_rest_of_the_batch_running() {
        let h = harness();
        let (due, now) = staggered_due_matches(&h);
        h.clock.set(now);
        // Consumed by the earliest match, which is advanced first.
        h.store.inject_conflicts(1);

        let first = h.scheduler.run_pass().await.unwrap();

        assert_eq!((first.started, first.conflicts), (2, 1));
        assert_eq!(status_of(&h, &due[0]), MatchStatus::Pending);
        assert_eq!(status_of(&h, &due[2]), MatchStatus::InProgress);

        h.clock.advance(chrono::Duration::seconds(60));
        let second = h.scheduler.run_pass().await.unwrap();

        assert_eq!(second.started, 1);
        assert!(due.iter().all(|m| status_of(&h, m) == MatchStatus::InProgress));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let scheduler = h.scheduler.clone();
        let task = tokio::spawn(async move { scheduler.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Periodic repair of the spatial index against the authoritative store.
//!
//! Search events are best effort, so the index can drift: a lost
//! `MatchLeftSearchIndex` leaves a cancelled match discoverable, a lost
//! `MatchBecameSearchable` hides an open one. The reconciler diffs the index
//! membership against the store's searchable set and repairs both directions.
//!
//! The index is listed *before* the store is scanned. A match that becomes
//! searchable in between is then reported missing and re-added (harmless), and
//! a match that leaves in between is reported stale and removed (correct).

use matchup_core::ids::MatchId;
use matchup_core::lock::{DistributedLock, LockError, LockRequest};
use matchup_core::spatial_index::{IndexError, SpatialIndex};
use matchup_core::store::{MatchScan, StoreError};
use matchup_runtime::metrics::SpatialIndexMetrics;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Errors that abort a reconciliation or rebuild.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Lock backend failed
    #[error("Reconcile lock error: {0}")]
    Lock(#[from] LockError),

    /// Reading the store failed
    #[error("Reconcile store read failed: {0}")]
    Store(#[from] StoreError),

    /// Listing or clearing the index failed
    #[error("Reconcile index operation failed: {0}")]
    Index(#[from] IndexError),
}

/// Reconciler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Time between reconciliations
    pub interval: Duration,
    /// Lock name shared by every instance
    pub lock_name: String,
    /// Lease expiry
    pub lock_at_most: Duration,
    /// Minimum hold
    pub lock_at_least: Duration,
    /// Matches loaded per store round trip
    pub batch_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            lock_name: "spatial-index-reconcile".to_string(),
            lock_at_most: Duration::from_secs(1800),
            lock_at_least: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

/// What one reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Lock was held elsewhere; nothing ran
    pub skipped: bool,
    /// Searchable matches found in the store
    pub searchable: usize,
    /// Members found in the index
    pub indexed: usize,
    /// Searchable matches that were added to the index
    pub missing_added: usize,
    /// Index members that were removed
    pub stale_removed: usize,
    /// Individual add/remove operations that failed
    pub failures: usize,
}

impl ReconcileReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether the index needed any repair.
    #[must_use]
    pub const fn repaired_anything(&self) -> bool {
        self.missing_added + self.stale_removed > 0
    }
}

/// Diffs and repairs the spatial index under a cluster-wide lock.
#[derive(Clone)]
pub struct IndexReconciler {
    scan: Arc<dyn MatchScan>,
    index: Arc<dyn SpatialIndex>,
    lock: Arc<dyn DistributedLock>,
    config: ReconcileConfig,
}

impl IndexReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        scan: Arc<dyn MatchScan>,
        index: Arc<dyn SpatialIndex>,
        lock: Arc<dyn DistributedLock>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            scan,
            index,
            lock,
            config,
        }
    }

    fn lock_request(&self) -> LockRequest {
        LockRequest::new(
            self.config.lock_name.clone(),
            self.config.lock_at_most,
            self.config.lock_at_least,
        )
    }

    /// Diff the index against the store and repair the difference.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if the lock, the store scan or the index listing
    /// fails. Individual repair failures are counted, not returned.
    #[tracing::instrument(skip(self), name = "reconcile_index")]
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let Some(lease) = self.lock.try_acquire(self.lock_request()).await? else {
            tracing::debug!(lock = %self.config.lock_name, "Reconciliation skipped, lock held elsewhere");
            return Ok(ReconcileReport::skipped());
        };

        let started_at = Instant::now();
        let result = self.diff_and_repair().await;

        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(error = %e, "Failed to release reconcile lock; it will expire");
        }

        match &result {
            Ok(report) if report.repaired_anything() => tracing::warn!(
                missing_added = report.missing_added,
                stale_removed = report.stale_removed,
                failures = report.failures,
                elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Spatial index drift repaired"
            ),
            Ok(report) => tracing::debug!(indexed = report.indexed, "Spatial index consistent"),
            Err(e) => tracing::error!(error = %e, "Reconciliation failed"),
        }
        result
    }

    async fn diff_and_repair(&self) -> Result<ReconcileReport, ReconcileError> {
        let indexed: HashSet<MatchId> = self.index.list_all().await?.into_iter().collect();
        let searchable: HashSet<MatchId> = self.scan.searchable_match_ids().await?.into_iter().collect();

        let mut report = ReconcileReport {
            searchable: searchable.len(),
            indexed: indexed.len(),
            ..ReconcileReport::default()
        };

        for stale in indexed.difference(&searchable) {
            match self.index.remove(*stale).await {
                Ok(()) => report.stale_removed += 1,
                Err(e) => {
                    tracing::warn!(match_id = %stale, error = %e, "Failed to remove stale index member");
                    report.failures += 1;
                }
            }
        }

        let missing: Vec<MatchId> = searchable.difference(&indexed).copied().collect();
        let (added, failed) = self.add_searchable(missing).await?;
        report.missing_added = added;
        report.failures += failed;

        SpatialIndexMetrics::record_repairs("stale_removed", report.stale_removed);
        SpatialIndexMetrics::record_repairs("missing_added", report.missing_added);
        Ok(report)
    }

    /// Loads `ids` in batches and adds those still searchable. Returns (added, failed).
    async fn add_searchable(&self, ids: Vec<MatchId>) -> Result<(usize, usize), ReconcileError> {
        let mut added = 0;
        let mut failed = 0;
        for chunk in ids.chunks(self.config.batch_size.max(1)) {
            let matches = self.scan.load_matches(chunk.to_vec()).await?;
            for m in matches.iter().filter(|m| m.is_searchable()) {
                match self.index.add(m.id, m.location).await {
                    Ok(()) => added += 1,
                    Err(e) => {
                        tracing::warn!(match_id = %m.id, error = %e, "Failed to add missing index member");
                        failed += 1;
                    }
                }
            }
        }
        Ok((added, failed))
    }

    /// Clear the index and repopulate it from the store.
    ///
    /// Used at startup, when the index may be empty or from an older deployment.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if the lock, the clear or the store scan fails.
    #[tracing::instrument(skip(self), name = "rebuild_index")]
    pub async fn rebuild(&self) -> Result<ReconcileReport, ReconcileError> {
        let Some(lease) = self.lock.try_acquire(self.lock_request()).await? else {
            tracing::info!("Index rebuild skipped, another instance holds the lock");
            return Ok(ReconcileReport::skipped());
        };

        let result = async {
            self.index.clear().await?;
            let searchable = self.scan.searchable_match_ids().await?;
            let total = searchable.len();
            let (added, failed) = self.add_searchable(searchable).await?;
            SpatialIndexMetrics::record_repairs("rebuilt", added);
            Ok::<_, ReconcileError>(ReconcileReport {
                searchable: total,
                missing_added: added,
                failures: failed,
                ..ReconcileReport::default()
            })
        }
        .await;

        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(error = %e, "Failed to release reconcile lock; it will expire");
        }

        if let Ok(report) = &result {
            tracing::info!(added = report.missing_added, failures = report.failures, "Spatial index rebuilt");
        }
        result
    }

    /// Reconcile every `config.interval` until shutdown.
    ///
    /// The first tick is skipped; startup runs [`rebuild`](Self::rebuild) instead.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            lock = %self.config.lock_name,
            "Starting index reconciler"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.reconcile().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Index reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use matchup_core::matches::MatchStatus;
    use matchup_testing::fixtures::MatchBuilder;
    use matchup_testing::{InMemoryLock, InMemoryMatchStore, InMemorySpatialIndex, ManualClock};

    struct Harness {
        store: InMemoryMatchStore,
        index: InMemorySpatialIndex,
        lock: InMemoryLock,
        reconciler: IndexReconciler,
    }

    fn harness() -> Harness {
        let store = InMemoryMatchStore::new();
        let index = InMemorySpatialIndex::new();
        let lock = InMemoryLock::new(Arc::new(ManualClock::default()));
        let reconciler = IndexReconciler::new(
            Arc::new(store.clone()),
            Arc::new(index.clone()),
            Arc::new(lock.clone()),
            ReconcileConfig::default(),
        );
        Harness {
            store,
            index,
            lock,
            reconciler,
        }
    }

    #[tokio::test]
    async fn consistent_index_is_left_alone() {
        let h = harness();
        let m = MatchBuilder::new().build();
        h.store.seed_match(m.clone());
        h.index.add(m.id, m.location).await.unwrap();
        let writes_before = h.index.write_count();

        let report = h.reconciler.reconcile().await.unwrap();

        assert!(!report.repaired_anything());
        assert_eq!(report.indexed, 1);
        assert_eq!(h.index.write_count(), writes_before);
    }

    #[tokio::test]
    async fn repairs_both_directions() {
        let h = harness();
        let open = MatchBuilder::new().build();
        let cancelled = MatchBuilder::new().status(MatchStatus::Cancelled).build();
        h.store.seed_match(open.clone());
        h.store.seed_match(cancelled.clone());
        h.index.add(cancelled.id, cancelled.location).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();

        assert_eq!(report.missing_added, 1);
        assert_eq!(report.stale_removed, 1);
        assert!(h.index.contains(open.id));
        assert!(!h.index.contains(cancelled.id));
    }

    #[tokio::test]
    async fn members_unknown_to_the_store_are_removed() {
        let h = harness();
        let ghost = MatchBuilder::new().build();
        h.index.add(ghost.id, ghost.location).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();

        assert_eq!(report.stale_removed, 1);
        assert!(h.index.is_empty());
    }

    #[tokio::test]
    async fn skipped_while_another_instance_holds_the_lock() {
        let h = harness();
        let config = ReconcileConfig::default();
        let _held = h
            .lock
            .try_acquire(LockRequest::new(config.lock_name, config.lock_at_most, config.lock_at_least))
            .await
            .unwrap()
            .unwrap();

        assert!(h.reconciler.reconcile().await.unwrap().skipped);
        assert!(h.reconciler.rebuild().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn rebuild_replaces_index_contents() {
        let h = harness();
        let a = MatchBuilder::new().build();
        let b = MatchBuilder::new().status(MatchStatus::Confirmed).build();
        let full = MatchBuilder::new().capacity(4).participants(4).status(MatchStatus::Full).build();
        for m in [&a, &b, &full] {
            h.store.seed_match(m.clone());
        }
        let ghost = MatchBuilder::new().build();
        h.index.add(ghost.id, ghost.location).await.unwrap();

        let report = h.reconciler.rebuild().await.unwrap();

        assert_eq!(report.missing_added, 2);
        assert_eq!(h.index.len(), 2);
        assert!(h.index.contains(a.id) && h.index.contains(b.id));
    }

    #[tokio::test]
    async fn index_outage_fails_the_reconciliation() {
        let h = harness();
        h.index.set_unavailable(true);

        let err = h.reconciler.reconcile().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Index(_)));
    }
}

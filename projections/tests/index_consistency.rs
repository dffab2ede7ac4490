//! Write path, event bus and index wired together in memory.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use matchup_core::ids::UserId;
use matchup_core::matches::Match;
use matchup_core::policy::LifecyclePolicy;
use matchup_core::store::VersionedEntityStore;
use matchup_projections::{IndexReconciler, ReconcileConfig, SpatialIndexSynchronizer};
use matchup_runtime::{CapacityConfig, CapacityCoordinator, MatchHosting, ParticipationLifecycle, SearchEventPublisher};
use matchup_testing::fixtures::MatchBuilder;
use matchup_testing::{InMemoryEventBus, InMemoryLock, InMemoryMatchStore, InMemorySpatialIndex, ManualClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Platform {
    store: InMemoryMatchStore,
    bus: InMemoryEventBus,
    events: SearchEventPublisher,
    index: InMemorySpatialIndex,
    hosting: MatchHosting,
    lifecycle: ParticipationLifecycle,
    reconciler: IndexReconciler,
}

impl Platform {
    fn new() -> Self {
        let store = InMemoryMatchStore::new();
        let bus = InMemoryEventBus::new();
        let index = InMemorySpatialIndex::new();
        let clock = Arc::new(ManualClock::default());
        let shared: Arc<dyn VersionedEntityStore> = Arc::new(store.clone());
        let events = SearchEventPublisher::new(Arc::new(bus.clone()));

        let hosting = MatchHosting::new(
            Arc::clone(&shared),
            events.clone(),
            clock.clone(),
            LifecyclePolicy::default(),
            CapacityConfig::default(),
        );
        let lifecycle = ParticipationLifecycle::new(
            Arc::clone(&shared),
            CapacityCoordinator::new(shared, CapacityConfig::default()),
            events.clone(),
            clock.clone(),
            LifecyclePolicy::default(),
        );
        let reconciler = IndexReconciler::new(
            Arc::new(store.clone()),
            Arc::new(index.clone()),
            Arc::new(InMemoryLock::new(clock)),
            ReconcileConfig {
                lock_at_least: Duration::ZERO,
                ..ReconcileConfig::default()
            },
        );

        Self {
            store,
            bus,
            events,
            index,
            hosting,
            lifecycle,
            reconciler,
        }
    }

    /// Spawns a synchronizer and waits until it has subscribed.
    async fn start_synchronizer(&self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (mut synchronizer, shutdown) = SpatialIndexSynchronizer::new(
            Arc::new(self.index.clone()),
            Arc::new(self.bus.clone()),
            "spatial-index-sync",
        );
        let handle = tokio::spawn(async move {
            synchronizer.start().await.unwrap();
        });
        tokio::task::yield_now().await;
        (shutdown, handle)
    }

    async fn host(&self) -> Match {
        self.hosting.create_match(MatchBuilder::new().draft()).await.unwrap()
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn index_follows_searchability_through_the_lifecycle() {
    let platform = Platform::new();
    let (_shutdown, _handle) = platform.start_synchronizer().await;

    let m = platform.host().await;
    eventually("created match indexed", || platform.index.contains(m.id)).await;
    assert_eq!(platform.index.position(m.id), Some(m.location));

    let mut joined = Vec::new();
    for _ in 0..3 {
        joined.push(platform.lifecycle.create(m.id, UserId::new()).await.unwrap());
    }
    eventually("full match removed", || !platform.index.contains(m.id)).await;

    let leaver = &joined[0];
    platform
        .lifecycle
        .cancel(m.id, leaver.id, leaver.user_id)
        .await
        .unwrap();
    eventually("freed match re-indexed", || platform.index.contains(m.id)).await;

    platform.hosting.cancel_match(m.id, m.host_id).await.unwrap();
    eventually("cancelled match removed", || !platform.index.contains(m.id)).await;
}

#[tokio::test]
async fn lost_removal_is_repaired_by_reconciliation() {
    let platform = Platform::new();
    let (_shutdown, _handle) = platform.start_synchronizer().await;

    let m = platform.host().await;
    eventually("created match indexed", || platform.index.contains(m.id)).await;

    // The cancel commits but its event never reaches the broker.
    platform.bus.set_failing(true);
    platform.hosting.cancel_match(m.id, m.host_id).await.unwrap();
    platform.events.flush().await;
    platform.bus.set_failing(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(platform.index.contains(m.id), "stale entry survives until repair");

    let report = platform.reconciler.reconcile().await.unwrap();

    assert_eq!(report.stale_removed, 1);
    assert!(!platform.index.contains(m.id));
    assert!(!platform.store.match_snapshot(m.id).unwrap().is_searchable());
}

#[tokio::test]
async fn lost_addition_is_repaired_by_reconciliation() {
    let platform = Platform::new();

    // No synchronizer running: every event is effectively lost.
    let a = platform.host().await;
    let b = platform
        .hosting
        .create_match(MatchBuilder::new().starting_at(a.schedule.end_at() + chrono::Duration::hours(1)).draft())
        .await
        .unwrap();
    assert!(platform.index.is_empty());

    let report = platform.reconciler.reconcile().await.unwrap();
    assert_eq!(report.missing_added, 2);
    assert_eq!(platform.index.position(b.id), Some(b.location));

    let again = platform.reconciler.reconcile().await.unwrap();
    assert!(!again.repaired_anything());
}

#[tokio::test]
async fn synchronizer_stops_on_shutdown() {
    let platform = Platform::new();
    let (shutdown, handle) = platform.start_synchronizer().await;

    shutdown.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("synchronizer did not stop")
        .unwrap();
}

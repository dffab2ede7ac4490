//! Wiring and background task lifecycle.
//!
//! [`Components`] holds the adapters behind their seam traits. [`App`] builds the
//! write-path services on top of them and [`App::start`] launches the three
//! background loops:
//!
//! 1. **Startup**: rebuild the spatial index from the store
//! 2. **Runtime**: lifecycle scheduler, index synchronizer, periodic reconciler
//! 3. **Shutdown**: flip the shared watch channel and wait for each task, bounded
//!    by the configured timeout

use crate::config::{Config, LockBackend};
use matchup_core::environment::{Clock, SystemClock};
use matchup_core::event_bus::{EventBus, EventBusError};
use matchup_core::lock::{DistributedLock, LockError};
use matchup_core::spatial_index::{IndexError, SpatialIndex};
use matchup_core::store::{MatchScan, StoreError, VersionedEntityStore};
use matchup_postgres::{PostgresLock, PostgresMatchStore};
use matchup_projections::{IndexReconciler, SpatialIndexSynchronizer};
use matchup_redis::{RedisLock, RedisSpatialIndex};
use matchup_redpanda::RedpandaEventBus;
use matchup_runtime::{
    CapacityCoordinator, MatchHosting, MatchLifecycleScheduler, ParticipationLifecycle, SearchEventPublisher,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Failures while connecting the adapters.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database pool or migrations
    #[error("Store setup failed: {0}")]
    Store(#[from] StoreError),

    /// Redis GEO index
    #[error("Spatial index setup failed: {0}")]
    Index(#[from] IndexError),

    /// Lock backend
    #[error("Lock setup failed: {0}")]
    Lock(#[from] LockError),

    /// Broker client
    #[error("Event bus setup failed: {0}")]
    EventBus(#[from] EventBusError),
}

/// Adapters behind their seam traits.
#[derive(Clone)]
pub struct Components {
    /// Authoritative store
    pub store: Arc<dyn VersionedEntityStore>,
    /// Scans over the same store
    pub scan: Arc<dyn MatchScan>,
    /// Geo index of searchable matches
    pub index: Arc<dyn SpatialIndex>,
    /// Cluster-wide lock for background jobs
    pub lock: Arc<dyn DistributedLock>,
    /// Search event transport
    pub event_bus: Arc<dyn EventBus>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Components {
    /// Connect every production adapter described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] for the first backend that cannot be reached.
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        tracing::info!("Connecting to match database...");
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(config.database.acquire_timeout)
            .idle_timeout(Some(config.database.idle_timeout))
            .connect(&config.database.url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let store = PostgresMatchStore::new(pool.clone());
        if config.database.run_migrations {
            store.migrate().await?;
            tracing::info!("Migrations applied");
        }
        let store = Arc::new(store);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        tracing::info!(key = %config.redis.geo_key, "Connecting to spatial index...");
        let index = RedisSpatialIndex::new(&config.redis.url, config.redis.geo_key.clone()).await?;

        let lock: Arc<dyn DistributedLock> = match config.server.lock_backend {
            LockBackend::Postgres => Arc::new(PostgresLock::new(
                pool,
                Arc::clone(&clock),
                config.server.instance_id.clone(),
            )),
            LockBackend::Redis => Arc::new(RedisLock::new(&config.redis.url, Arc::clone(&clock)).await?),
        };

        tracing::info!(brokers = %config.redpanda.brokers, "Connecting to event bus...");
        let event_bus = RedpandaEventBus::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .producer_acks(&config.redpanda.producer_acks)
            .build()?;

        Ok(Self {
            store: store.clone(),
            scan: store,
            index: Arc::new(index),
            lock,
            event_bus: Arc::new(event_bus),
            clock,
        })
    }
}

/// The assembled core: write-path services plus background jobs.
pub struct App {
    components: Components,
    config: Config,
    lifecycle: ParticipationLifecycle,
    hosting: MatchHosting,
    scheduler: MatchLifecycleScheduler,
    reconciler: IndexReconciler,
    events: SearchEventPublisher,
}

impl App {
    /// Build the services over `components`.
    ///
    /// Spawns the search event relay, so this must run inside a Tokio runtime.
    #[must_use]
    pub fn new(components: Components, config: Config) -> Self {
        let events = SearchEventPublisher::builder(Arc::clone(&components.event_bus))
            .topic(config.redpanda.topic.clone())
            .spawn();

        let lifecycle = ParticipationLifecycle::new(
            Arc::clone(&components.store),
            CapacityCoordinator::new(Arc::clone(&components.store), config.capacity.clone()),
            events.clone(),
            Arc::clone(&components.clock),
            config.policy.clone(),
        );
        let hosting = MatchHosting::new(
            Arc::clone(&components.store),
            events.clone(),
            Arc::clone(&components.clock),
            config.policy.clone(),
            config.capacity.clone(),
        );
        let scheduler = MatchLifecycleScheduler::new(
            Arc::clone(&components.store),
            Arc::clone(&components.scan),
            Arc::clone(&components.lock),
            events.clone(),
            Arc::clone(&components.clock),
            config.scheduler.clone(),
        );
        let reconciler = IndexReconciler::new(
            Arc::clone(&components.scan),
            Arc::clone(&components.index),
            Arc::clone(&components.lock),
            config.reconcile.clone(),
        );

        Self {
            components,
            config,
            lifecycle,
            hosting,
            scheduler,
            reconciler,
            events,
        }
    }

    /// Participant-facing operations.
    #[must_use]
    pub const fn lifecycle(&self) -> &ParticipationLifecycle {
        &self.lifecycle
    }

    /// Host-facing operations.
    #[must_use]
    pub const fn hosting(&self) -> &MatchHosting {
        &self.hosting
    }

    /// Rebuild the index, then spawn the background loops.
    ///
    /// A failed rebuild is logged and startup continues; the periodic reconciler
    /// repairs the index later.
    pub async fn start(&self) -> Running {
        match self.reconciler.rebuild().await {
            Ok(report) if report.skipped => {
                tracing::info!("Another instance holds the reconcile lock; skipping initial index rebuild");
            }
            Ok(report) => {
                tracing::info!(indexed = report.missing_added, failures = report.failures, "Spatial index rebuilt");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial index rebuild failed; relying on periodic reconciliation");
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        let scheduler = self.scheduler.clone();
        let rx = shutdown_rx.clone();
        tasks.push(("scheduler", tokio::spawn(async move { scheduler.run(rx).await })));

        let reconciler = self.reconciler.clone();
        let rx = shutdown_rx.clone();
        tasks.push(("reconciler", tokio::spawn(async move { reconciler.run(rx).await })));

        let (synchronizer, _private) = SpatialIndexSynchronizer::new(
            Arc::clone(&self.components.index),
            Arc::clone(&self.components.event_bus),
            self.config.redpanda.consumer_group.clone(),
        );
        let mut synchronizer = synchronizer
            .with_topic(self.config.redpanda.topic.clone())
            .with_shutdown(shutdown_rx);
        tasks.push((
            "synchronizer",
            tokio::spawn(async move {
                if let Err(e) = synchronizer.start().await {
                    tracing::error!(error = %e, "Spatial index synchronizer failed to start");
                }
            }),
        ));

        tracing::info!(tasks = tasks.len(), "Background tasks started");
        Running {
            shutdown_tx,
            events: self.events.clone(),
            tasks,
            timeout: self.config.server.shutdown_timeout,
        }
    }
}

/// Handles of the spawned background loops.
pub struct Running {
    shutdown_tx: watch::Sender<bool>,
    events: SearchEventPublisher,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    timeout: Duration,
}

impl Running {
    /// Names of the running tasks.
    #[must_use]
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Signal every task and wait for it, giving each at most the shutdown timeout.
    ///
    /// Queued search events get the same timeout to drain first. Returns the number
    /// of tasks that stopped cleanly.
    pub async fn shutdown(self) -> usize {
        if tokio::time::timeout(self.timeout, self.events.flush()).await.is_err() {
            tracing::warn!("Search events still queued at shutdown; reconciliation will repair the index");
        }
        let _ = self.shutdown_tx.send(true);

        let mut stopped = 0;
        for (name, handle) in self.tasks {
            match tokio::time::timeout(self.timeout, handle).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "Task stopped gracefully");
                    stopped += 1;
                }
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task failed"),
                Err(_) => tracing::warn!(task = name, "Task shutdown timed out"),
            }
        }
        stopped
    }
}

//! Prometheus metrics for observability and monitoring.
//!
//! Covers the write path and the background tasks:
//! - Capacity commits and compare-and-set conflicts
//! - Scheduler passes and status transitions
//! - After-commit search event publishing
//! - Spatial index operations and reconciliation repairs
//!
//! # Example
//!
//! ```rust,no_run
//! use matchup_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus optional scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr` (e.g. `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Install the recorder without an HTTP endpoint; use [`Self::render`] to scrape.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed. A recorder
    /// that is already installed (as happens across tests) is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built, bound or installed.
    pub fn serve(&self) -> Result<(), MetricsError> {
        register_metrics();
        Self::builder()?
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format; `None` before [`Self::start`].
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "capacity_commits_total",
        "Participation writes committed together with a capacity change"
    );
    describe_counter!(
        "capacity_conflicts_total",
        "Version conflicts seen by the capacity coordinator, by outcome (retried, exhausted)"
    );
    describe_histogram!(
        "capacity_adjust_duration_seconds",
        "Wall time of one capacity adjustment including retries"
    );

    describe_counter!(
        "scheduler_transitions_total",
        "Match status transitions applied by the lifecycle scheduler, by target status"
    );
    describe_counter!(
        "scheduler_passes_total",
        "Lifecycle scheduler passes, by outcome (completed, skipped, failed)"
    );
    describe_histogram!(
        "scheduler_pass_duration_seconds",
        "Wall time of one lifecycle scheduler pass"
    );

    describe_counter!(
        "search_events_published_total",
        "Search index events published after commit"
    );
    describe_counter!(
        "search_events_publish_failures_total",
        "Search index events dropped after exhausting publish retries"
    );
    describe_counter!(
        "search_events_outbox_overflow_total",
        "Search index events dropped because the publish outbox was full or closed"
    );

    describe_counter!(
        "spatial_index_ops_total",
        "Spatial index mutations applied by the synchronizer, by op (add, remove)"
    );
    describe_counter!(
        "reconcile_repairs_total",
        "Drift repaired by reconciliation, by kind (missing, stale)"
    );
}

/// Capacity coordinator metrics recorder.
pub struct CapacityMetrics;

impl CapacityMetrics {
    /// Record a committed adjustment.
    pub fn record_commit(duration: Duration) {
        counter!("capacity_commits_total").increment(1);
        histogram!("capacity_adjust_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a conflict that will be retried.
    pub fn record_retried_conflict() {
        counter!("capacity_conflicts_total", "outcome" => "retried").increment(1);
    }

    /// Record a conflict that exhausted the attempt budget.
    pub fn record_exhausted() {
        counter!("capacity_conflicts_total", "outcome" => "exhausted").increment(1);
    }
}

/// Lifecycle scheduler metrics recorder.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record one applied transition into `to` (`IN_PROGRESS` or `ENDED`).
    pub fn record_transition(to: &'static str) {
        counter!("scheduler_transitions_total", "to" => to).increment(1);
    }

    /// Record a finished pass.
    pub fn record_pass(outcome: &'static str, duration: Duration) {
        counter!("scheduler_passes_total", "outcome" => outcome).increment(1);
        histogram!("scheduler_pass_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a pass skipped because another instance holds the lock.
    pub fn record_skipped() {
        counter!("scheduler_passes_total", "outcome" => "skipped").increment(1);
    }
}

/// Search event publishing metrics recorder.
pub struct SearchEventMetrics;

impl SearchEventMetrics {
    /// Record a published event.
    pub fn record_published() {
        counter!("search_events_published_total").increment(1);
    }

    /// Record an event that could not be published.
    pub fn record_failure() {
        counter!("search_events_publish_failures_total").increment(1);
    }

    /// Record an event that never entered the outbox.
    pub fn record_overflow() {
        counter!("search_events_outbox_overflow_total").increment(1);
    }
}

/// Spatial index metrics recorder.
pub struct SpatialIndexMetrics;

impl SpatialIndexMetrics {
    /// Record an applied index mutation (`add` or `remove`).
    pub fn record_op(op: &'static str) {
        counter!("spatial_index_ops_total", "op" => op).increment(1);
    }

    /// Record `count` reconciliation repairs of `kind` (`missing` or `stale`).
    pub fn record_repairs(kind: &'static str, count: usize) {
        counter!("reconcile_repairs_total", "kind" => kind)
            .increment(u64::try_from(count).unwrap_or(u64::MAX));
    }
}

//! # Matchup Projections
//!
//! Keeps the geospatial search index in step with the authoritative store.
//!
//! ## Components
//!
//! - **`SpatialIndexSynchronizer`**: consumes search events and applies them idempotently
//! - **`IndexReconciler`**: periodic diff-and-repair plus a full rebuild for startup
//!
//! ## Example
//!
//! ```ignore
//! use matchup_projections::{IndexReconciler, ReconcileConfig, SpatialIndexSynchronizer};
//!
//! let reconciler = IndexReconciler::new(scan, index.clone(), lock, ReconcileConfig::default());
//! reconciler.rebuild().await?;
//!
//! let (mut synchronizer, shutdown) = SpatialIndexSynchronizer::new(index, event_bus, "spatial-index-sync");
//! tokio::spawn(async move { synchronizer.start().await });
//! ```

/// Periodic index repair
pub mod reconcile;

/// Event-driven index updates
pub mod synchronizer;

pub use reconcile::{IndexReconciler, ReconcileConfig, ReconcileError, ReconcileReport};
pub use synchronizer::{SpatialIndexSynchronizer, SyncError};

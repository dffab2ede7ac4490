//! # Matchup Core
//!
//! Domain types and seams for concurrency-safe match capacity and lifecycle management.
//!
//! ## Concepts
//!
//! - **Match**: a time-boxed resource with a fixed number of slots
//! - **Participation**: one user's membership request against one match
//! - **Version**: optimistic concurrency counter compared-and-set by the store
//! - **Searchable**: a match in `Pending` or `Confirmed`, mirrored into a geo index
//!
//! ## Seams
//!
//! Everything with I/O sits behind a trait so the runtime can be tested in memory
//! and run against Postgres, Redis and Redpanda in production:
//!
//! - [`store::VersionedEntityStore`] and [`store::MatchScan`]: authoritative data
//! - [`spatial_index::SpatialIndex`]: derived proximity index
//! - [`lock::DistributedLock`]: cluster-wide mutual exclusion for background passes
//! - [`event_bus::EventBus`]: post-commit notifications
//! - [`environment::Clock`]: wall-clock time

pub mod error;
pub mod event;
pub mod event_bus;
pub mod ids;
pub mod lock;
pub mod matches;
pub mod participation;
pub mod policy;
pub mod spatial_index;
pub mod store;
pub mod version;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{LifecycleError, Result};
pub use ids::{MatchId, ParticipationId, UserId};
pub use matches::{GeoPoint, Match, MatchDraft, MatchSchedule, MatchStatus};
pub use participation::{Participation, ParticipationAction, ParticipationStatus};
pub use version::Version;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Deadlines, scheduler scans and lock leases all read time through this trait.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

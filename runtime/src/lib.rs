//! # Matchup Runtime
//!
//! Write-path coordination and the time-driven scheduler.
//!
//! ## Core Components
//!
//! - **`CapacityCoordinator`**: the only writer of a match's participant count; bounded,
//!   jittered compare-and-set retries
//! - **`ParticipationLifecycle`**: join, approve, reject, cancel, reactivate
//! - **`MatchHosting`**: create, cancel, reactivate and resize matches
//! - **`MatchLifecycleScheduler`**: lock-guarded start/end passes
//! - **`SearchEventPublisher`**: queued, best-effort after-commit notifications for the
//!   spatial index; write paths never wait on the broker
//!
//! ## Example
//!
//! ```ignore
//! use matchup_runtime::{CapacityConfig, CapacityCoordinator, ParticipationLifecycle, SearchEventPublisher};
//!
//! let capacity = CapacityCoordinator::new(store.clone(), CapacityConfig::default());
//! let lifecycle = ParticipationLifecycle::new(
//!     store,
//!     capacity,
//!     SearchEventPublisher::new(event_bus),
//!     clock,
//!     LifecyclePolicy::default(),
//! );
//!
//! let participation = lifecycle.create(match_id, user_id).await?;
//! ```

/// Bounded capacity adjustment
pub mod capacity;

/// Host operations on matches
pub mod hosting;

/// Prometheus metrics for observability
pub mod metrics;

/// Participation state transitions
pub mod participation;

/// After-commit search event publishing
pub mod publisher;

/// Retry logic with exponential backoff and jitter
pub mod retry;

/// Cluster-safe lifecycle scheduler
pub mod scheduler;

pub use capacity::{CapacityConfig, CapacityCoordinator, CapacityOutcome, CapacityPlan, ParticipationChange};
pub use hosting::MatchHosting;
pub use participation::ParticipationLifecycle;
pub use publisher::{DEFAULT_OUTBOX_CAPACITY, SearchEventPublisher, SearchEventPublisherBuilder};
pub use scheduler::{MatchLifecycleScheduler, PassReport, SchedulerConfig, SchedulerError};

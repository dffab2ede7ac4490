//! # Matchup Testing
//!
//! In-memory doubles for every matchup port, deterministic clocks and fixtures.
//!
//! - [`InMemoryMatchStore`]: versioned store with CAS, partial-unique and conflict injection
//! - [`InMemorySpatialIndex`]: haversine-backed index with outage simulation
//! - [`InMemoryLock`]: clock-driven named lease table
//! - [`InMemoryEventBus`]: broadcast bus with a publish log
//!
//! ## Example
//!
//! ```
//! use matchup_testing::{fixtures::MatchBuilder, InMemoryMatchStore};
//!
//! let store = InMemoryMatchStore::new();
//! let m = MatchBuilder::new().capacity(4).build();
//! store.seed_match(m.clone());
//! assert_eq!(store.match_snapshot(m.id), Some(m));
//! ```

use chrono::{DateTime, Utc};
use matchup_core::environment::Clock;

pub mod event_bus_mocks;
pub mod fixtures;
pub mod index_mocks;
pub mod lock_mocks;
pub mod store_mocks;

/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Mutex, PoisonError};

    /// 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use matchup_testing::mocks::FixedClock;
    /// use matchup_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Share it behind an `Arc` between the component under test and the test body.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move forward by `by`.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }
}

pub use event_bus_mocks::InMemoryEventBus;
pub use index_mocks::InMemorySpatialIndex;
pub use lock_mocks::InMemoryLock;
pub use mocks::{test_clock, test_epoch, FixedClock, ManualClock};
pub use store_mocks::InMemoryMatchStore;

//! Builders and proptest strategies for domain values.

#![allow(clippy::expect_used)] // Fixtures panic on nonsense input instead of threading errors through tests

use crate::mocks::test_epoch;
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use matchup_core::ids::{MatchId, UserId};
use matchup_core::matches::{GeoPoint, Match, MatchDraft, MatchSchedule, MatchStatus};
use matchup_core::participation::ParticipationAction;
use matchup_core::version::Version;
use proptest::prelude::*;

/// Fluent builder for [`Match`] snapshots.
///
/// Defaults: capacity 4, host only, `Pending`, version 0, two hours starting
/// 10:00 the day after [`test_epoch`], located in Seoul.
///
/// ```
/// use matchup_testing::fixtures::MatchBuilder;
/// use matchup_core::MatchStatus;
///
/// let m = MatchBuilder::new().capacity(6).participants(3).build();
/// assert_eq!(m.status, MatchStatus::Pending);
/// assert_eq!(m.current_participants, 3);
/// ```
#[derive(Clone, Debug)]
pub struct MatchBuilder {
    id: MatchId,
    host_id: UserId,
    title: String,
    location: GeoPoint,
    start_at: DateTime<Utc>,
    duration: Duration,
    capacity: u32,
    participants: u32,
    status: MatchStatus,
    version: Version,
    cancelled_at: Option<DateTime<Utc>>,
}

impl Default for MatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchBuilder {
    /// Start from the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: MatchId::new(),
            host_id: UserId::new(),
            title: "Pickup futsal".to_string(),
            location: seoul(),
            start_at: test_epoch() + Duration::hours(34),
            duration: Duration::hours(2),
            capacity: 4,
            participants: 1,
            status: MatchStatus::Pending,
            version: Version::INITIAL,
            cancelled_at: None,
        }
    }

    /// Fix the identity.
    #[must_use]
    pub const fn id(mut self, id: MatchId) -> Self {
        self.id = id;
        self
    }

    /// Fix the host.
    #[must_use]
    pub const fn host(mut self, host_id: UserId) -> Self {
        self.host_id = host_id;
        self
    }

    /// Title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Venue.
    #[must_use]
    pub const fn at(mut self, location: GeoPoint) -> Self {
        self.location = location;
        self
    }

    /// Start instant; must leave the whole window inside one UTC day.
    #[must_use]
    pub const fn starting_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = start_at;
        self
    }

    /// Window length.
    #[must_use]
    pub const fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Maximum participants including the host.
    #[must_use]
    pub const fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Occupied slots including the host.
    #[must_use]
    pub const fn participants(mut self, participants: u32) -> Self {
        self.participants = participants;
        self
    }

    /// Lifecycle status.
    #[must_use]
    pub const fn status(mut self, status: MatchStatus) -> Self {
        self.status = status;
        self
    }

    /// Stored version.
    #[must_use]
    pub const fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Mark cancelled at `at`.
    #[must_use]
    pub const fn cancelled(mut self, at: DateTime<Utc>) -> Self {
        self.status = MatchStatus::Cancelled;
        self.cancelled_at = Some(at);
        self
    }

    /// Schedule derived from `starting_at` and `lasting`.
    ///
    /// # Panics
    ///
    /// Panics if the window crosses midnight.
    #[must_use]
    pub fn schedule(&self) -> MatchSchedule {
        let end = self.start_at + self.duration;
        assert_eq!(
            self.start_at.date_naive(),
            end.date_naive(),
            "fixture window must stay within one day"
        );
        MatchSchedule::new(self.start_at.date_naive(), clock_time(self.start_at), clock_time(end))
            .expect("fixture window must be non-empty")
    }

    /// Draft matching the builder's fields.
    #[must_use]
    pub fn draft(&self) -> MatchDraft {
        MatchDraft {
            host_id: self.host_id,
            title: self.title.clone(),
            description: String::new(),
            address: "Mapo-gu, Seoul".to_string(),
            location: self.location,
            schedule: self.schedule(),
            max_participants: self.capacity,
        }
    }

    /// Build the snapshot.
    #[must_use]
    pub fn build(self) -> Match {
        let mut m = Match::create(self.id, self.draft());
        m.current_participants = self.participants;
        m.status = self.status;
        m.version = self.version;
        m.cancelled_at = self.cancelled_at;
        m
    }
}

fn clock_time(at: DateTime<Utc>) -> NaiveTime {
    NaiveTime::from_hms_opt(at.hour(), at.minute(), at.second()).expect("valid time of day")
}

/// A point in central Seoul.
#[must_use]
pub fn seoul() -> GeoPoint {
    GeoPoint::new(126.978, 37.566).expect("valid coordinates")
}

/// Offset `point` east by `km` along its parallel.
#[must_use]
pub fn east_of(point: GeoPoint, km: f64) -> GeoPoint {
    let per_degree = 111.32 * point.latitude.to_radians().cos();
    GeoPoint::new(point.longitude + km / per_degree, point.latitude).expect("valid coordinates")
}

/// Any participation action.
pub fn participation_action() -> impl Strategy<Value = ParticipationAction> {
    prop_oneof![
        Just(ParticipationAction::Create),
        Just(ParticipationAction::Approve),
        Just(ParticipationAction::Reject),
        Just(ParticipationAction::Cancel),
        Just(ParticipationAction::Reactivate),
    ]
}

/// Valid coordinates inside the indexable latitude band.
pub fn geo_point() -> impl Strategy<Value = GeoPoint> {
    (-180.0_f64..180.0, -85.0_f64..85.0)
        .prop_map(|(lon, lat)| GeoPoint::new(lon, lat).expect("strategy stays in range"))
}

//! The `Match` aggregate: a time-boxed, capacity-limited resource.
//!
//! All transitions are pure. They take `&self` and return a new value; the caller
//! persists the result through the versioned store. The returned value keeps the
//! version it was derived from, which is exactly the `expected` version of the
//! compare-and-set write that persists it.
//!
//! # Lifecycle
//!
//! ```text
//!            join (count reaches max)
//!   Pending ─────────────────────────► Full
//!      ▲ │ ◄─────────────────────────── │
//!      │ │   leave (count drops below)  │
//!      │ │                              │
//!      │ └──────────┬───────────────────┘
//!      │            │ start (scheduler)
//!      │            ▼
//!      │        InProgress ──end──► Ended
//!      │
//!      └── reactivate ── Cancelled ◄── cancel (host, before deadline)
//! ```

use crate::error::{LifecycleError, Result};
use crate::ids::{MatchId, UserId};
use crate::policy::LifecyclePolicy;
use crate::version::Version;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Participants a new match starts with. The host occupies one slot.
pub const INITIAL_PARTICIPANTS: u32 = 1;

/// Match lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    /// Accepting participants.
    Pending,
    /// Accepting participants; confirmed by the host.
    Confirmed,
    /// Every slot is taken.
    Full,
    /// Start time passed.
    InProgress,
    /// End time passed. Terminal.
    Ended,
    /// Cancelled by the host. Reactivatable within a window.
    Cancelled,
}

impl MatchStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Full => "FULL",
            Self::InProgress => "IN_PROGRESS",
            Self::Ended => "ENDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Statuses that appear in proximity search.
    #[must_use]
    pub const fn is_searchable(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Statuses the scheduler may move to `InProgress`.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Full)
    }

    /// Statuses the scheduler may move to `Ended`.
    #[must_use]
    pub const fn can_end(self) -> bool {
        matches!(self, Self::InProgress)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unknown status strings read from storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for MatchStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "FULL" => Ok(Self::Full),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "ENDED" => Ok(Self::Ended),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Coordinates outside the range a geo index accepts.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Invalid coordinates: longitude {longitude}, latitude {latitude}")]
pub struct InvalidCoordinates {
    /// Rejected longitude
    pub longitude: f64,
    /// Rejected latitude
    pub latitude: f64,
}

/// A WGS84 point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Degrees east, `-180..=180`
    pub longitude: f64,
    /// Degrees north, `-85.05112878..=85.05112878`
    pub latitude: f64,
}

impl GeoPoint {
    /// Latitude bound of web-mercator geo sets.
    pub const MAX_LATITUDE: f64 = 85.051_128_78;

    const EARTH_RADIUS_KM: f64 = 6_372.797_560_856;

    /// Create a point, validating its range.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCoordinates`] if either coordinate is out of range or not finite.
    pub fn new(longitude: f64, latitude: f64) -> std::result::Result<Self, InvalidCoordinates> {
        let valid = longitude.is_finite()
            && latitude.is_finite()
            && (-180.0..=180.0).contains(&longitude)
            && (-Self::MAX_LATITUDE..=Self::MAX_LATITUDE).contains(&latitude);
        if valid {
            Ok(Self { longitude, latitude })
        } else {
            Err(InvalidCoordinates { longitude, latitude })
        }
    }

    /// Great-circle distance in kilometres (haversine, same earth radius as Redis).
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// When a match takes place. Times are wall-clock UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSchedule {
    date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

impl MatchSchedule {
    /// Create a schedule.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidMatch`] if `start_time` is not before `end_time`.
    pub fn new(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Result<Self> {
        if start_time >= end_time {
            return Err(LifecycleError::InvalidMatch(format!(
                "start time {start_time} must be before end time {end_time}"
            )));
        }
        Ok(Self {
            date,
            start_time,
            end_time,
        })
    }

    /// Match day.
    #[must_use]
    pub const fn date(&self) -> NaiveDate {
        self.date
    }

    /// Start time of day.
    #[must_use]
    pub const fn start_time(&self) -> NaiveTime {
        self.start_time
    }

    /// End time of day.
    #[must_use]
    pub const fn end_time(&self) -> NaiveTime {
        self.end_time
    }

    /// Start instant.
    #[must_use]
    pub fn start_at(&self) -> DateTime<Utc> {
        NaiveDateTime::new(self.date, self.start_time).and_utc()
    }

    /// End instant.
    #[must_use]
    pub fn end_at(&self) -> DateTime<Utc> {
        NaiveDateTime::new(self.date, self.end_time).and_utc()
    }

    /// Half-open interval overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start_at() < other.end_at() && other.start_at() < self.end_at()
    }
}

/// Input for creating a match.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchDraft {
    /// Hosting user
    pub host_id: UserId,
    /// Short title
    pub title: String,
    /// Free text
    pub description: String,
    /// Human-readable address
    pub address: String,
    /// Venue coordinates
    pub location: GeoPoint,
    /// Date and time window
    pub schedule: MatchSchedule,
    /// Capacity including the host
    pub max_participants: u32,
}

/// A match snapshot as read from the authoritative store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// Identity
    pub id: MatchId,
    /// Optimistic concurrency counter
    pub version: Version,
    /// Hosting user
    pub host_id: UserId,
    /// Short title
    pub title: String,
    /// Free text
    pub description: String,
    /// Human-readable address
    pub address: String,
    /// Venue coordinates
    pub location: GeoPoint,
    /// Date and time window
    pub schedule: MatchSchedule,
    /// Capacity including the host
    pub max_participants: u32,
    /// Occupied slots including the host and pending requests
    pub current_participants: u32,
    /// Lifecycle status
    pub status: MatchStatus,
    /// Set while cancelled
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Match {
    /// Build a new `Pending` match from a validated draft.
    #[must_use]
    pub fn create(id: MatchId, draft: MatchDraft) -> Self {
        Self {
            id,
            version: Version::INITIAL,
            host_id: draft.host_id,
            title: draft.title,
            description: draft.description,
            address: draft.address,
            location: draft.location,
            schedule: draft.schedule,
            max_participants: draft.max_participants,
            current_participants: INITIAL_PARTICIPANTS,
            status: MatchStatus::Pending,
            cancelled_at: None,
        }
    }

    /// Whether `user` hosts this match.
    #[must_use]
    pub fn is_host(&self, user: UserId) -> bool {
        self.host_id == user
    }

    /// Whether the match belongs in proximity search.
    #[must_use]
    pub const fn is_searchable(&self) -> bool {
        self.status.is_searchable()
    }

    /// Whether a new participation could take a slot right now.
    #[must_use]
    pub const fn can_participate(&self) -> bool {
        self.status.is_searchable() && self.current_participants < self.max_participants
    }

    /// Whether the start instant is in the past.
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now > self.schedule.start_at()
    }

    /// Whether the end instant is in the past.
    #[must_use]
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now > self.schedule.end_at()
    }

    /// Check that a participation may take a slot.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::MatchFull`] when a joinable match has no slot left,
    /// [`LifecycleError::MatchNotJoinable`] for any other status.
    pub fn ensure_joinable(&self) -> Result<()> {
        if self.can_participate() {
            return Ok(());
        }
        if self.status == MatchStatus::Full || self.status.is_searchable() {
            Err(LifecycleError::MatchFull(self.id))
        } else {
            Err(LifecycleError::MatchNotJoinable {
                match_id: self.id,
                status: self.status,
            })
        }
    }

    /// Apply a participant count change, keeping `0 <= count <= max` and the
    /// `Full` status consistent with the count.
    ///
    /// Dropping below capacity from `Full` always reverts to `Pending`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::MatchFull`] if the increase would exceed capacity,
    /// [`LifecycleError::InvalidStateTransition`] if the decrease would go negative.
    pub fn with_participant_delta(&self, delta: i32) -> Result<Self> {
        let current = i64::from(self.current_participants);
        let next = current + i64::from(delta);

        if next > i64::from(self.max_participants) {
            return Err(LifecycleError::MatchFull(self.id));
        }
        let count = u32::try_from(next).map_err(|_| LifecycleError::InvalidStateTransition {
            from: self.status.to_string(),
            action: "remove participant",
        })?;

        let mut updated = self.clone();
        updated.current_participants = count;
        if count >= self.max_participants && self.status.is_searchable() {
            updated.status = MatchStatus::Full;
        } else if count < self.max_participants && self.status == MatchStatus::Full {
            updated.status = MatchStatus::Pending;
        }
        Ok(updated)
    }

    /// Host change of capacity.
    ///
    /// Allowed while the match is open (`Pending`, `Confirmed` or `Full`) and has not
    /// started. Reaching the new capacity makes the match `Full`; raising it above the
    /// count of a `Full` match reverts to `Pending`.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::NotHost`] if `actor` is not the host
    /// - [`LifecycleError::InvalidMatch`] outside the policy's capacity bounds
    /// - [`LifecycleError::CapacityBelowParticipants`] below the current count
    /// - [`LifecycleError::MatchAlreadyStarted`] once in progress, ended, or past start
    /// - [`LifecycleError::InvalidStateTransition`] for a cancelled match
    pub fn with_max_participants(
        &self,
        actor: UserId,
        max_participants: u32,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<Self> {
        if !self.is_host(actor) {
            return Err(LifecycleError::NotHost);
        }
        match self.status {
            MatchStatus::InProgress | MatchStatus::Ended => {
                return Err(LifecycleError::MatchAlreadyStarted(self.id));
            }
            MatchStatus::Cancelled => return Err(self.invalid("update capacity")),
            MatchStatus::Pending | MatchStatus::Confirmed | MatchStatus::Full => {}
        }
        if self.has_started(now) {
            return Err(LifecycleError::MatchAlreadyStarted(self.id));
        }
        policy.validate_capacity(max_participants)?;
        if max_participants < self.current_participants {
            return Err(LifecycleError::CapacityBelowParticipants {
                match_id: self.id,
                current: self.current_participants,
                requested: max_participants,
            });
        }

        let mut updated = self.clone();
        updated.max_participants = max_participants;
        if self.current_participants >= max_participants {
            updated.status = MatchStatus::Full;
        } else if self.status == MatchStatus::Full {
            updated.status = MatchStatus::Pending;
        }
        Ok(updated)
    }

    /// Scheduler transition to `InProgress`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidStateTransition`] unless status is Pending, Confirmed or Full.
    pub fn start(&self) -> Result<Self> {
        if !self.status.can_start() {
            return Err(self.invalid("start"));
        }
        Ok(self.with_status(MatchStatus::InProgress))
    }

    /// Scheduler transition to `Ended`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidStateTransition`] unless status is `InProgress`.
    pub fn end(&self) -> Result<Self> {
        if !self.status.can_end() {
            return Err(self.invalid("end"));
        }
        Ok(self.with_status(MatchStatus::Ended))
    }

    /// Host cancellation.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::NotHost`] if `actor` is not the host
    /// - [`LifecycleError::MatchAlreadyStarted`] once in progress, ended, or past start
    /// - [`LifecycleError::InvalidStateTransition`] if already cancelled
    /// - [`LifecycleError::CancelWindowExceeded`] inside the cancellation deadline
    pub fn cancel(&self, actor: UserId, now: DateTime<Utc>, policy: &LifecyclePolicy) -> Result<Self> {
        if !self.is_host(actor) {
            return Err(LifecycleError::NotHost);
        }
        match self.status {
            MatchStatus::InProgress | MatchStatus::Ended => {
                return Err(LifecycleError::MatchAlreadyStarted(self.id));
            }
            MatchStatus::Cancelled => return Err(self.invalid("cancel")),
            MatchStatus::Pending | MatchStatus::Confirmed | MatchStatus::Full => {}
        }
        if self.has_started(now) {
            return Err(LifecycleError::MatchAlreadyStarted(self.id));
        }
        if now > self.schedule.start_at() - policy.cancel_deadline {
            return Err(LifecycleError::CancelWindowExceeded(self.id));
        }

        let mut cancelled = self.with_status(MatchStatus::Cancelled);
        cancelled.cancelled_at = Some(now);
        Ok(cancelled)
    }

    /// Host reactivation of a cancelled match.
    ///
    /// The match returns to `Pending`, or `Full` if every slot is still taken.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotHost`] or [`LifecycleError::CannotReactivate`].
    pub fn reactivate(&self, actor: UserId, now: DateTime<Utc>, policy: &LifecyclePolicy) -> Result<Self> {
        if !self.is_host(actor) {
            return Err(LifecycleError::NotHost);
        }
        if self.status != MatchStatus::Cancelled {
            return Err(LifecycleError::CannotReactivate(format!(
                "match is {}, not cancelled",
                self.status
            )));
        }
        let Some(cancelled_at) = self.cancelled_at else {
            return Err(LifecycleError::CannotReactivate(
                "cancellation time unknown".to_string(),
            ));
        };
        if self.has_started(now) {
            return Err(LifecycleError::CannotReactivate(
                "match start time has passed".to_string(),
            ));
        }
        if now > cancelled_at + policy.reactivate_window {
            return Err(LifecycleError::CannotReactivate(
                "reactivation window expired".to_string(),
            ));
        }

        let status = if self.current_participants >= self.max_participants {
            MatchStatus::Full
        } else {
            MatchStatus::Pending
        };
        let mut reactivated = self.with_status(status);
        reactivated.cancelled_at = None;
        Ok(reactivated)
    }

    fn with_status(&self, status: MatchStatus) -> Self {
        let mut updated = self.clone();
        updated.status = status;
        updated
    }

    fn invalid(&self, action: &'static str) -> LifecycleError {
        LifecycleError::InvalidStateTransition {
            from: self.status.to_string(),
            action,
        }
    }
}

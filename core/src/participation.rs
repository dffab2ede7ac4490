//! Participation state machine.
//!
//! | From              | Action     | To        | Capacity |
//! |-------------------|------------|-----------|----------|
//! | (none)            | create     | Pending   | +1       |
//! | Pending           | approve    | Confirmed | 0        |
//! | Pending           | reject     | Rejected  | -1       |
//! | Pending/Confirmed | cancel     | Cancelled | -1       |
//! | Cancelled         | reactivate | Pending   | +1       |
//!
//! A `Pending` request already occupies a slot, so capacity moves at request time
//! rather than at approval time.

use crate::error::{LifecycleError, Result};
use crate::ids::{MatchId, ParticipationId, UserId};
use crate::matches::UnknownStatus;
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Participation status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipationStatus {
    /// Awaiting host decision. Occupies a slot.
    Pending,
    /// Approved by the host.
    Confirmed,
    /// Withdrawn by the participant or host.
    Cancelled,
    /// Declined by the host.
    Rejected,
}

impl ParticipationStatus {
    /// Statuses that count as active membership.
    pub const ACTIVE: [Self; 2] = [Self::Pending, Self::Confirmed];

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Whether this status holds a capacity slot.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl fmt::Display for ParticipationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "CANCELLED" => Ok(Self::Cancelled),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A transition request against the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipationAction {
    /// New request (or re-join of a cancelled row)
    Create,
    /// Host accepts
    Approve,
    /// Host declines
    Reject,
    /// Participant or host withdraws
    Cancel,
    /// Cancelled row becomes pending again
    Reactivate,
}

impl ParticipationAction {
    /// Change to the match's participant count this action causes.
    #[must_use]
    pub const fn capacity_delta(self) -> i32 {
        match self {
            Self::Create | Self::Reactivate => 1,
            Self::Approve => 0,
            Self::Reject | Self::Cancel => -1,
        }
    }

    /// Verb used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Reactivate => "reactivate",
        }
    }
}

/// One user's membership record in one match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    /// Identity
    pub id: ParticipationId,
    /// Optimistic concurrency counter, independent of the match's
    pub version: Version,
    /// Match joined
    pub match_id: MatchId,
    /// Joining user
    pub user_id: UserId,
    /// Current status
    pub status: ParticipationStatus,
    /// When the request was (re)made
    pub joined_at: DateTime<Utc>,
}

impl Participation {
    /// A new pending request.
    #[must_use]
    pub fn pending(match_id: MatchId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: ParticipationId::new(),
            version: Version::INITIAL,
            match_id,
            user_id,
            status: ParticipationStatus::Pending,
            joined_at: now,
        }
    }

    /// Whether this row holds a slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Apply a transition, returning the new record.
    ///
    /// `Create` is only valid through [`Participation::pending`] and is rejected here.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidStateTransition`] if the action is not allowed from
    /// the current status.
    pub fn apply(&self, action: ParticipationAction, now: DateTime<Utc>) -> Result<Self> {
        use ParticipationStatus::{Cancelled, Confirmed, Pending, Rejected};

        let next = match (self.status, action) {
            (Pending, ParticipationAction::Approve) => Confirmed,
            (Pending, ParticipationAction::Reject) => Rejected,
            (Pending | Confirmed, ParticipationAction::Cancel) => Cancelled,
            (Cancelled, ParticipationAction::Reactivate) => Pending,
            (from, action) => {
                return Err(LifecycleError::InvalidStateTransition {
                    from: from.to_string(),
                    action: action.name(),
                });
            }
        };

        let mut updated = self.clone();
        updated.status = next;
        if action == ParticipationAction::Reactivate {
            updated.joined_at = now;
        }
        Ok(updated)
    }
}

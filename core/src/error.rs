//! Caller-facing error taxonomy for participation and match lifecycle operations.
//!
//! Errors fall into three groups:
//!
//! - **Business-rule violations** are definitive outcomes. They are never retried.
//! - **Transient conflicts** ([`LifecycleError::CapacityConflict`]) mean the optimistic
//!   retry budget ran out under contention. Callers should present these as "please retry".
//! - **Infrastructure failures** ([`LifecycleError::Store`]) come from the authoritative store.
//!
//! Spatial index and event bus failures never appear here: they are isolated to the
//! asynchronous synchronizer and repaired by reconciliation.

use crate::ids::{MatchId, ParticipationId};
use crate::matches::MatchStatus;
use crate::store::StoreError;
use thiserror::Error;

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors returned by participation, capacity and hosting operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The match has no free slot left.
    #[error("Match {0} is full")]
    MatchFull(MatchId),

    /// The match status does not accept new or reactivated participations.
    #[error("Match {match_id} is not joinable in status {status}")]
    MatchNotJoinable {
        /// Match that rejected the request
        match_id: MatchId,
        /// Status observed in the snapshot
        status: MatchStatus,
    },

    /// An active participation already exists for this user and match.
    #[error("User already has an active participation in this match")]
    DuplicateParticipation,

    /// Cancellation requested too close to the match start.
    #[error("Cancellation window closed for match {0}")]
    CancelWindowExceeded(MatchId),

    /// The actor is not the match host.
    #[error("Only the host may perform this action")]
    NotHost,

    /// The actor does not own the participation.
    #[error("Only the participant may perform this action")]
    NotParticipant,

    /// Hosts occupy their own slot and cannot join as participants.
    #[error("Host cannot participate in their own match")]
    HostCannotParticipate,

    /// The user already participates in a match whose schedule overlaps.
    #[error("Schedule overlaps with match {0}")]
    OverlappingParticipation(MatchId),

    /// The host already hosts a match whose schedule overlaps.
    #[error("Host already has an overlapping match {0}")]
    OverlappingHosting(MatchId),

    /// The match is in progress, ended, or its start time has passed.
    #[error("Match {0} has already started")]
    MatchAlreadyStarted(MatchId),

    /// A new capacity would leave fewer slots than participants already hold.
    #[error("Match {match_id} has {current} participants, capacity {requested} is too small")]
    CapacityBelowParticipants {
        /// Match being updated
        match_id: MatchId,
        /// Slots currently taken, host included
        current: u32,
        /// Requested capacity
        requested: u32,
    },

    /// Match reactivation preconditions failed.
    #[error("Cannot reactivate match: {0}")]
    CannotReactivate(String),

    /// A state machine transition is not allowed from the current status.
    #[error("Cannot {action} from status {from}")]
    InvalidStateTransition {
        /// Current status
        from: String,
        /// Attempted action
        action: &'static str,
    },

    /// A new match violates creation policy.
    #[error("Invalid match: {0}")]
    InvalidMatch(String),

    /// No match with this id.
    #[error("Match {0} not found")]
    MatchNotFound(MatchId),

    /// No participation with this id (or it belongs to another match).
    #[error("Participation {0} not found")]
    ParticipationNotFound(ParticipationId),

    /// Optimistic retries exhausted under contention. Safe to retry.
    #[error("Match {match_id} is busy after {attempts} attempts, please retry")]
    CapacityConflict {
        /// Contended match
        match_id: MatchId,
        /// Attempts made before giving up
        attempts: usize,
    },

    /// Authoritative store failure.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl LifecycleError {
    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityConflict { .. })
    }

    /// Whether this is a definitive business outcome.
    #[must_use]
    pub const fn is_business_rule(&self) -> bool {
        !matches!(self, Self::CapacityConflict { .. } | Self::Store(_))
    }

    /// Whether this wraps a store-level version conflict.
    ///
    /// Only the capacity coordinator sees these; it converts exhaustion into
    /// [`LifecycleError::CapacityConflict`].
    #[must_use]
    pub const fn is_version_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::VersionConflict { .. }))
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateParticipation => Self::DuplicateParticipation,
            other => Self::Store(other),
        }
    }
}

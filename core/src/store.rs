//! Versioned persistence seam for `Match` and `Participation`.
//!
//! # Compare-and-set
//!
//! Every update carries the version the writer read. The store persists it only if
//! the stored version still matches, bumping it by one; otherwise it reports
//! [`StoreError::VersionConflict`] and changes nothing. A [`WriteBatch`] is
//! committed in one storage transaction: either every write succeeds or none do.
//! This is how a participation change and the match counter change it implies are
//! made atomic.
//!
//! # Uniqueness
//!
//! At most one active (`Pending` or `Confirmed`) participation may exist per
//! `(match_id, user_id)`. Implementations enforce this at the storage level and
//! report [`StoreError::DuplicateParticipation`], so the guard holds even when two
//! application-level existence checks race.
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures so services can hold `Arc<dyn VersionedEntityStore>`.

use crate::ids::{MatchId, ParticipationId, UserId};
use crate::matches::Match;
use crate::participation::Participation;
use crate::version::Version;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Which aggregate a write targeted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    /// `Match`
    Match,
    /// `Participation`
    Participation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match => f.write_str("match"),
            Self::Participation => f.write_str("participation"),
        }
    }
}

/// Errors from the authoritative store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Stored version differs from the expected one (`actual` is `None` if the row is gone).
    #[error("Version conflict on {entity} {id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        /// Aggregate kind
        entity: EntityKind,
        /// Aggregate id
        id: String,
        /// Version the writer read
        expected: Version,
        /// Version currently stored
        actual: Option<Version>,
    },

    /// Insert would create a second active participation for the same user and match.
    #[error("Active participation already exists")]
    DuplicateParticipation,

    /// Insert of an id that already exists.
    #[error("{entity} {id} already exists")]
    AlreadyExists {
        /// Aggregate kind
        entity: EntityKind,
        /// Aggregate id
        id: String,
    },

    /// Stored data could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Driver or connection failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether this is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// A single write inside a [`WriteBatch`].
///
/// For updates, the entity's `version` field is the expected (read) version.
#[derive(Clone, Debug, PartialEq)]
pub enum VersionedWrite {
    /// Insert a new match at [`Version::INITIAL`].
    InsertMatch(Match),
    /// Compare-and-set a match.
    UpdateMatch(Match),
    /// Insert a new participation at [`Version::INITIAL`].
    InsertParticipation(Participation),
    /// Compare-and-set a participation.
    UpdateParticipation(Participation),
}

impl VersionedWrite {
    /// Version stored once this write commits.
    #[must_use]
    pub const fn stored_version(&self) -> Version {
        match self {
            Self::InsertMatch(_) | Self::InsertParticipation(_) => Version::INITIAL,
            Self::UpdateMatch(m) => m.version.next(),
            Self::UpdateParticipation(p) => p.version.next(),
        }
    }
}

/// Writes committed atomically.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<VersionedWrite>,
}

impl WriteBatch {
    /// Empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self { writes: Vec::new() }
    }

    /// Append a write.
    #[must_use]
    pub fn with(mut self, write: VersionedWrite) -> Self {
        self.writes.push(write);
        self
    }

    /// Append a write in place.
    pub fn push(&mut self, write: VersionedWrite) {
        self.writes.push(write);
    }

    /// Writes in order.
    #[must_use]
    pub fn writes(&self) -> &[VersionedWrite] {
        &self.writes
    }

    /// Consume into the writes.
    #[must_use]
    pub fn into_writes(self) -> Vec<VersionedWrite> {
        self.writes
    }

    /// Number of writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the batch has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Return `m` as it is stored after an update committed.
#[must_use]
pub fn committed_match(mut m: Match) -> Match {
    m.version = m.version.next();
    m
}

/// Return `p` as it is stored after a write committed.
#[must_use]
pub fn committed_participation(mut p: Participation, inserted: bool) -> Participation {
    if !inserted {
        p.version = p.version.next();
    }
    p
}

/// Authoritative store with optimistic concurrency.
pub trait VersionedEntityStore: Send + Sync {
    /// Read a match snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn load_match(&self, id: MatchId) -> StoreFuture<'_, Option<Match>>;

    /// Read a participation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn load_participation(&self, id: ParticipationId) -> StoreFuture<'_, Option<Participation>>;

    /// The active participation of `user` in `match_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn find_active_participation(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> StoreFuture<'_, Option<Participation>>;

    /// The most recent cancelled participation of `user` in `match_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn find_cancelled_participation(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> StoreFuture<'_, Option<Participation>>;

    /// Non-terminal matches in which `user` holds an active participation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn active_matches_for_participant(&self, user_id: UserId) -> StoreFuture<'_, Vec<Match>>;

    /// Non-terminal matches hosted by `host`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn active_matches_for_host(&self, host_id: UserId) -> StoreFuture<'_, Vec<Match>>;

    /// Commit every write in `batch` atomically.
    ///
    /// # Errors
    ///
    /// - [`StoreError::VersionConflict`] if any update's expected version is stale
    /// - [`StoreError::DuplicateParticipation`] if an insert violates active uniqueness
    /// - [`StoreError::AlreadyExists`] if an insert reuses an id
    /// - [`StoreError::Database`] on I/O failure
    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()>;
}

/// Read-only scans used by background tasks.
pub trait MatchScan: Send + Sync {
    /// Matches in a startable status whose start instant is before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn matches_due_to_start(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MatchId>>;

    /// `InProgress` matches whose end instant is before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn matches_due_to_end(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MatchId>>;

    /// Ids of every searchable match.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn searchable_match_ids(&self) -> StoreFuture<'_, Vec<MatchId>>;

    /// Bulk snapshot read. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on I/O failure.
    fn load_matches(&self, ids: Vec<MatchId>) -> StoreFuture<'_, Vec<Match>>;
}

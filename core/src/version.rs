//! Optimistic concurrency version counter.
//!
//! Every persisted `Match` and `Participation` carries a [`Version`]. Writers read
//! the entity, compute a new state, and ask the store to persist it only if the
//! stored version still equals the version they read. A successful write stores
//! `expected.next()`; a mismatch is reported as a conflict and nothing changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when a storage-level integer cannot represent a [`Version`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid version value: {0}")]
pub struct InvalidVersion(pub i64);

/// Monotonic per-entity write counter.
///
/// Versions start at [`Version::INITIAL`] when an entity is first inserted and
/// increase by exactly one per successful write.
///
/// # Examples
///
/// ```
/// use matchup_core::version::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert!(v0 < v1);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version assigned to a freshly inserted entity.
    pub const INITIAL: Self = Self(0);

    /// Create a version with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version a successful write stores.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Check if this is the insert version.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Postgres stores versions as `BIGINT`.
impl TryFrom<i64> for Version {
    type Error = InvalidVersion;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| InvalidVersion(value))
    }
}

impl TryFrom<Version> for i64 {
    type Error = InvalidVersion;

    fn try_from(version: Version) -> Result<Self, Self::Error> {
        Self::try_from(version.0).map_err(|_| InvalidVersion(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_increments_by_one() {
        let v = Version::new(41);
        assert_eq!(v.next(), Version::new(42));
        assert_eq!(v.next().value() - v.value(), 1);
    }

    #[test]
    fn initial_is_zero() {
        assert!(Version::INITIAL.is_initial());
        assert!(!Version::INITIAL.next().is_initial());
    }

    #[test]
    fn display_has_prefix() {
        assert_eq!(Version::new(7).to_string(), "v7");
    }

    #[test]
    fn converts_from_bigint() {
        assert_eq!(Version::try_from(3_i64), Ok(Version::new(3)));
        assert_eq!(Version::try_from(-1_i64), Err(InvalidVersion(-1)));

        let raw: Result<i64, _> = Version::new(9).try_into();
        assert_eq!(raw, Ok(9));
    }

    #[test]
    fn ordering_follows_counter() {
        assert!(Version::new(1) < Version::new(2));
        assert!(Version::new(10) > Version::INITIAL);
    }
}

//! Geospatial index seam used for proximity search.
//!
//! The index is a derived view of the searchable matches. It is written only by the
//! synchronizer and the reconciler, never by request handling. Both mutating
//! operations are idempotent: adding a present member moves it, removing an absent
//! member does nothing.

use crate::ids::MatchId;
use crate::matches::GeoPoint;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by index methods.
pub type IndexFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IndexError>> + Send + 'a>>;

/// Errors from the index backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// Backend unreachable.
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the command.
    #[error("Index command failed: {0}")]
    Command(String),

    /// A stored member could not be parsed back into a match id.
    #[error("Malformed index member: {0}")]
    MalformedMember(String),
}

/// A search hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NearbyMatch {
    /// Match id
    pub match_id: MatchId,
    /// Distance from the search centre
    pub distance_km: f64,
}

/// Proximity query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RadiusQuery {
    /// Search centre
    pub center: GeoPoint,
    /// Radius in kilometres
    pub radius_km: f64,
    /// Hits to skip (pagination)
    pub offset: usize,
    /// Maximum hits to return
    pub limit: usize,
}

impl RadiusQuery {
    /// First page of `limit` hits around `center`.
    #[must_use]
    pub const fn new(center: GeoPoint, radius_km: f64, limit: usize) -> Self {
        Self {
            center,
            radius_km,
            offset: 0,
            limit,
        }
    }

    /// Skip the first `offset` hits.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Derived geospatial index.
pub trait SpatialIndex: Send + Sync {
    /// Insert or move `match_id` to `point`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if the backend fails.
    fn add(&self, match_id: MatchId, point: GeoPoint) -> IndexFuture<'_, ()>;

    /// Remove `match_id`; absent members are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if the backend fails.
    fn remove(&self, match_id: MatchId) -> IndexFuture<'_, ()>;

    /// Members within the radius, nearest first, paginated.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if the backend fails.
    fn find_within_radius(&self, query: RadiusQuery) -> IndexFuture<'_, Vec<NearbyMatch>>;

    /// Every indexed member.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if the backend fails or a member is malformed.
    fn list_all(&self) -> IndexFuture<'_, Vec<MatchId>>;

    /// Drop every member.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if the backend fails.
    fn clear(&self) -> IndexFuture<'_, ()>;
}

/// Index member name for a match.
#[must_use]
pub fn member_name(match_id: MatchId) -> String {
    format!("match:{match_id}")
}

/// Parse an index member name back into a match id.
///
/// # Errors
///
/// Returns [`IndexError::MalformedMember`] if the prefix or id is wrong.
pub fn parse_member(member: &str) -> Result<MatchId, IndexError> {
    member
        .strip_prefix("match:")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| IndexError::MalformedMember(member.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_names_round_trip() {
        let id = MatchId::new();
        assert_eq!(parse_member(&member_name(id)), Ok(id));
    }

    #[test]
    fn malformed_members_are_reported() {
        assert!(parse_member("user:123").is_err());
        assert!(parse_member("match:nope").is_err());
    }
}

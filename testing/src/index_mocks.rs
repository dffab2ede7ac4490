//! In-memory spatial index with outage simulation.

use matchup_core::ids::MatchId;
use matchup_core::matches::GeoPoint;
use matchup_core::spatial_index::{IndexError, IndexFuture, NearbyMatch, RadiusQuery, SpatialIndex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// `HashMap`-backed [`SpatialIndex`] using haversine distances.
///
/// Call [`InMemorySpatialIndex::set_unavailable`] to make every operation fail,
/// which is how tests simulate a Redis outage.
#[derive(Clone, Debug, Default)]
pub struct InMemorySpatialIndex {
    members: Arc<Mutex<HashMap<MatchId, GeoPoint>>>,
    unavailable: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl InMemorySpatialIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self) -> MutexGuard<'_, HashMap<MatchId, GeoPoint>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), IndexError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(IndexError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    /// Toggle the simulated outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether `match_id` is indexed.
    #[must_use]
    pub fn contains(&self, match_id: MatchId) -> bool {
        self.members().contains_key(&match_id)
    }

    /// Stored point for `match_id`.
    #[must_use]
    pub fn position(&self, match_id: MatchId) -> Option<GeoPoint> {
        self.members().get(&match_id).copied()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members().len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }

    /// Successful add/remove calls so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SpatialIndex for InMemorySpatialIndex {
    fn add(&self, match_id: MatchId, point: GeoPoint) -> IndexFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.members().insert(match_id, point);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn remove(&self, match_id: MatchId) -> IndexFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.members().remove(&match_id);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn find_within_radius(&self, query: RadiusQuery) -> IndexFuture<'_, Vec<NearbyMatch>> {
        Box::pin(async move {
            self.check_available()?;
            let mut hits: Vec<NearbyMatch> = self
                .members()
                .iter()
                .map(|(id, point)| NearbyMatch {
                    match_id: *id,
                    distance_km: query.center.distance_km(point),
                })
                .filter(|hit| hit.distance_km <= query.radius_km)
                .collect();
            hits.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
            Ok(hits.into_iter().skip(query.offset).take(query.limit).collect())
        })
    }

    fn list_all(&self) -> IndexFuture<'_, Vec<MatchId>> {
        Box::pin(async move {
            self.check_available()?;
            let mut ids: Vec<MatchId> = self.members().keys().copied().collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn clear(&self) -> IndexFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.members().clear();
            Ok(())
        })
    }
}

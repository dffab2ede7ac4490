//! Redis GEO set implementation of the spatial index.
//!
//! # Layout
//!
//! One sorted set (default key `matches:geo`) holds every searchable match as
//! member `match:{uuid}` with its geohash score. `GEOADD` on an existing member
//! moves it and `ZREM` of an absent member is a no-op, which gives the
//! idempotency at-least-once delivery needs.

use matchup_core::ids::MatchId;
use matchup_core::matches::GeoPoint;
use matchup_core::spatial_index::{
    IndexError, IndexFuture, NearbyMatch, RadiusQuery, SpatialIndex, member_name, parse_member,
};
use redis::aio::ConnectionManager;
use redis::geo::Coord;
use redis::{AsyncCommands, Client};

/// Default GEO set key.
pub const DEFAULT_GEO_KEY: &str = "matches:geo";

/// `Redis`-backed [`SpatialIndex`].
///
/// # Example
///
/// ```no_run
/// use matchup_redis::RedisSpatialIndex;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let index = RedisSpatialIndex::new("redis://127.0.0.1:6379", "matches:geo").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisSpatialIndex {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    key: String,
}

impl RedisSpatialIndex {
    /// Connect to `redis_url` and use the GEO set at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Unavailable`] if the connection fails.
    pub async fn new(redis_url: &str, key: impl Into<String>) -> Result<Self, IndexError> {
        let client = Client::open(redis_url)
            .map_err(|e| IndexError::Unavailable(format!("Failed to create Redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            IndexError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;
        Ok(Self::from_manager(conn_manager, key))
    }

    /// Share an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn_manager,
            key: key.into(),
        }
    }

    /// The GEO set key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl SpatialIndex for RedisSpatialIndex {
    fn add(&self, match_id: MatchId, point: GeoPoint) -> IndexFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = conn
                .geo_add(
                    &self.key,
                    (Coord::lon_lat(point.longitude, point.latitude), member_name(match_id)),
                )
                .await
                .map_err(index_error)?;
            tracing::trace!(match_id = %match_id, "GEOADD");
            Ok(())
        })
    }

    fn remove(&self, match_id: MatchId) -> IndexFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = conn
                .zrem(&self.key, member_name(match_id))
                .await
                .map_err(index_error)?;
            tracing::trace!(match_id = %match_id, "ZREM");
            Ok(())
        })
    }

    fn find_within_radius(&self, query: RadiusQuery) -> IndexFuture<'_, Vec<NearbyMatch>> {
        Box::pin(async move {
            if query.limit == 0 {
                return Ok(Vec::new());
            }
            let mut conn = self.conn_manager.clone();
            // COUNT applies before pagination, so fetch through the end of the page.
            let hits: Vec<(String, f64)> = redis::cmd("GEOSEARCH")
                .arg(&self.key)
                .arg("FROMLONLAT")
                .arg(query.center.longitude)
                .arg(query.center.latitude)
                .arg("BYRADIUS")
                .arg(query.radius_km)
                .arg("km")
                .arg("ASC")
                .arg("COUNT")
                .arg(query.offset.saturating_add(query.limit))
                .arg("WITHDIST")
                .query_async(&mut conn)
                .await
                .map_err(index_error)?;

            hits.into_iter()
                .skip(query.offset)
                .map(|(member, distance_km)| {
                    Ok(NearbyMatch {
                        match_id: parse_member(&member)?,
                        distance_km,
                    })
                })
                .collect()
        })
    }

    fn list_all(&self) -> IndexFuture<'_, Vec<MatchId>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let members: Vec<String> = conn.zrange(&self.key, 0, -1).await.map_err(index_error)?;
            members.iter().map(|m| parse_member(m)).collect()
        })
    }

    fn clear(&self) -> IndexFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = conn.del(&self.key).await.map_err(index_error)?;
            tracing::info!(key = %self.key, "Spatial index cleared");
            Ok(())
        })
    }
}

/// Connection-level failures are `Unavailable`; everything else is a rejected command.
fn index_error(err: redis::RedisError) -> IndexError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        IndexError::Unavailable(err.to_string())
    } else {
        IndexError::Command(err.to_string())
    }
}

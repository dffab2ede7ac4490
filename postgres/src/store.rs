//! `PostgreSQL` implementation of the versioned entity store.
//!
//! Updates are `UPDATE ... WHERE id = $1 AND version = $2`. Under `READ COMMITTED`
//! a concurrent writer blocks on the row lock and then re-evaluates the predicate
//! against the committed row, so exactly one of two racing writers sees one
//! affected row. A [`WriteBatch`] runs in one transaction; any failed write drops
//! the transaction and rolls back the whole batch.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use matchup_core::ids::{MatchId, ParticipationId, UserId};
use matchup_core::matches::{GeoPoint, Match, MatchSchedule, MatchStatus};
use matchup_core::participation::{Participation, ParticipationStatus};
use matchup_core::store::{
    EntityKind, MatchScan, StoreError, StoreFuture, VersionedEntityStore, VersionedWrite, WriteBatch,
};
use matchup_core::version::Version;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use std::time::Duration;
use uuid::Uuid;

/// Name of the partial unique index guarding active participations.
pub const ACTIVE_PARTICIPATION_INDEX: &str = "uq_participations_active";

macro_rules! match_columns {
    () => {
        "id, version, host_id, title, description, address, longitude, latitude, \
         match_date, start_time, end_time, max_participants, current_participants, \
         status, cancelled_at"
    };
}

macro_rules! participation_columns {
    () => {
        "id, version, match_id, user_id, status, joined_at"
    };
}

/// `PostgreSQL`-backed [`VersionedEntityStore`] and [`MatchScan`].
///
/// # Example
///
/// ```no_run
/// use matchup_postgres::PostgresMatchStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresMatchStore::connect("postgres://localhost/matchup", 10).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresMatchStore {
    pool: PgPool,
}

impl PostgresMatchStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection cannot be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(database)?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations (matches, participations, shedlock).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
    }

    /// The underlying pool, shared with [`PostgresLock`](crate::PostgresLock).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_matches(&self, sql: &'static str, id: Uuid) -> Result<Vec<Match>, StoreError> {
        let rows = sqlx::query(sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        rows.iter().map(match_from_row).collect()
    }

    async fn fetch_participation(
        &self,
        sql: &'static str,
        match_id: MatchId,
        user_id: UserId,
    ) -> Result<Option<Participation>, StoreError> {
        sqlx::query(sql)
            .bind(match_id.as_uuid())
            .bind(user_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .as_ref()
            .map(participation_from_row)
            .transpose()
    }

    async fn fetch_due(
        &self,
        sql: &'static str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MatchId>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ids: Vec<Uuid> = sqlx::query_scalar(sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        Ok(ids.into_iter().map(MatchId::from_uuid).collect())
    }
}

impl VersionedEntityStore for PostgresMatchStore {
    fn load_match(&self, id: MatchId) -> StoreFuture<'_, Option<Match>> {
        Box::pin(async move {
            sqlx::query(concat!("SELECT ", match_columns!(), " FROM matches WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(database)?
                .as_ref()
                .map(match_from_row)
                .transpose()
        })
    }

    fn load_participation(&self, id: ParticipationId) -> StoreFuture<'_, Option<Participation>> {
        Box::pin(async move {
            sqlx::query(concat!(
                "SELECT ",
                participation_columns!(),
                " FROM participations WHERE id = $1"
            ))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .as_ref()
            .map(participation_from_row)
            .transpose()
        })
    }

    fn find_active_participation(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> StoreFuture<'_, Option<Participation>> {
        Box::pin(self.fetch_participation(
            concat!(
                "SELECT ",
                participation_columns!(),
                " FROM participations WHERE match_id = $1 AND user_id = $2 \
                 AND status IN ('PENDING', 'CONFIRMED')"
            ),
            match_id,
            user_id,
        ))
    }

    fn find_cancelled_participation(
        &self,
        match_id: MatchId,
        user_id: UserId,
    ) -> StoreFuture<'_, Option<Participation>> {
        Box::pin(self.fetch_participation(
            concat!(
                "SELECT ",
                participation_columns!(),
                " FROM participations WHERE match_id = $1 AND user_id = $2 \
                 AND status = 'CANCELLED' ORDER BY joined_at DESC LIMIT 1"
            ),
            match_id,
            user_id,
        ))
    }

    fn active_matches_for_participant(&self, user_id: UserId) -> StoreFuture<'_, Vec<Match>> {
        Box::pin(self.fetch_matches(
            concat!(
                "SELECT ",
                match_columns!(),
                " FROM matches WHERE status NOT IN ('ENDED', 'CANCELLED') AND id IN \
                 (SELECT match_id FROM participations \
                  WHERE user_id = $1 AND status IN ('PENDING', 'CONFIRMED'))"
            ),
            *user_id.as_uuid(),
        ))
    }

    fn active_matches_for_host(&self, host_id: UserId) -> StoreFuture<'_, Vec<Match>> {
        Box::pin(self.fetch_matches(
            concat!(
                "SELECT ",
                match_columns!(),
                " FROM matches WHERE host_id = $1 AND status NOT IN ('ENDED', 'CANCELLED')"
            ),
            *host_id.as_uuid(),
        ))
    }

    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let writes = batch.len();
            let mut tx = self.pool.begin().await.map_err(database)?;
            for write in batch.into_writes() {
                let result = match &write {
                    VersionedWrite::InsertMatch(m) => insert_match(&mut *tx, m).await,
                    VersionedWrite::UpdateMatch(m) => update_match(&mut *tx, m).await,
                    VersionedWrite::InsertParticipation(p) => insert_participation(&mut *tx, p).await,
                    VersionedWrite::UpdateParticipation(p) => update_participation(&mut *tx, p).await,
                };
                if let Err(e) = result {
                    if e.is_version_conflict() {
                        metrics::counter!("store_version_conflicts_total").increment(1);
                    }
                    tracing::debug!(error = %e, "Write batch rolled back");
                    return Err(e);
                }
            }
            tx.commit().await.map_err(database)?;
            tracing::trace!(writes, "Write batch committed");
            Ok(())
        })
    }
}

impl MatchScan for PostgresMatchStore {
    fn matches_due_to_start(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MatchId>> {
        Box::pin(self.fetch_due(
            "SELECT id FROM matches WHERE status IN ('PENDING', 'CONFIRMED', 'FULL') \
             AND start_at < $1 ORDER BY start_at LIMIT $2",
            now,
            limit,
        ))
    }

    fn matches_due_to_end(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<MatchId>> {
        Box::pin(self.fetch_due(
            "SELECT id FROM matches WHERE status = 'IN_PROGRESS' AND end_at < $1 \
             ORDER BY end_at LIMIT $2",
            now,
            limit,
        ))
    }

    fn searchable_match_ids(&self) -> StoreFuture<'_, Vec<MatchId>> {
        Box::pin(async move {
            let ids: Vec<Uuid> =
                sqlx::query_scalar("SELECT id FROM matches WHERE status IN ('PENDING', 'CONFIRMED') ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(database)?;
            Ok(ids.into_iter().map(MatchId::from_uuid).collect())
        })
    }

    fn load_matches(&self, ids: Vec<MatchId>) -> StoreFuture<'_, Vec<Match>> {
        Box::pin(async move {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
            let rows = sqlx::query(concat!("SELECT ", match_columns!(), " FROM matches WHERE id = ANY($1)"))
                .bind(&ids)
                .fetch_all(&self.pool)
                .await
                .map_err(database)?;
            rows.iter().map(match_from_row).collect()
        })
    }
}

async fn insert_match(conn: &mut PgConnection, m: &Match) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO matches (id, version, host_id, title, description, address, longitude, latitude, \
         match_date, start_time, end_time, start_at, end_at, max_participants, current_participants, \
         status, cancelled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
    )
    .bind(m.id.as_uuid())
    .bind(to_bigint(Version::INITIAL)?)
    .bind(m.host_id.as_uuid())
    .bind(&m.title)
    .bind(&m.description)
    .bind(&m.address)
    .bind(m.location.longitude)
    .bind(m.location.latitude)
    .bind(m.schedule.date())
    .bind(m.schedule.start_time())
    .bind(m.schedule.end_time())
    .bind(m.schedule.start_at())
    .bind(m.schedule.end_at())
    .bind(to_int(m.max_participants)?)
    .bind(to_int(m.current_participants)?)
    .bind(m.status.as_str())
    .bind(m.cancelled_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match unique_violation(&e) {
        Some(_) => StoreError::AlreadyExists {
            entity: EntityKind::Match,
            id: m.id.to_string(),
        },
        None => database(e),
    })?;
    Ok(())
}

async fn update_match(conn: &mut PgConnection, m: &Match) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE matches SET version = version + 1, title = $3, description = $4, address = $5, \
         longitude = $6, latitude = $7, match_date = $8, start_time = $9, end_time = $10, \
         start_at = $11, end_at = $12, max_participants = $13, current_participants = $14, \
         status = $15, cancelled_at = $16, updated_at = now() \
         WHERE id = $1 AND version = $2",
    )
    .bind(m.id.as_uuid())
    .bind(to_bigint(m.version)?)
    .bind(&m.title)
    .bind(&m.description)
    .bind(&m.address)
    .bind(m.location.longitude)
    .bind(m.location.latitude)
    .bind(m.schedule.date())
    .bind(m.schedule.start_time())
    .bind(m.schedule.end_time())
    .bind(m.schedule.start_at())
    .bind(m.schedule.end_at())
    .bind(to_int(m.max_participants)?)
    .bind(to_int(m.current_participants)?)
    .bind(m.status.as_str())
    .bind(m.cancelled_at)
    .execute(&mut *conn)
    .await
    .map_err(database)?;

    if result.rows_affected() == 1 {
        return Ok(());
    }
    let actual = stored_version(conn, "SELECT version FROM matches WHERE id = $1", *m.id.as_uuid()).await?;
    Err(StoreError::VersionConflict {
        entity: EntityKind::Match,
        id: m.id.to_string(),
        expected: m.version,
        actual,
    })
}

async fn insert_participation(conn: &mut PgConnection, p: &Participation) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO participations (id, version, match_id, user_id, status, joined_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(p.id.as_uuid())
    .bind(to_bigint(Version::INITIAL)?)
    .bind(p.match_id.as_uuid())
    .bind(p.user_id.as_uuid())
    .bind(p.status.as_str())
    .bind(p.joined_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match unique_violation(&e) {
        Some(constraint) if constraint == ACTIVE_PARTICIPATION_INDEX => StoreError::DuplicateParticipation,
        Some(_) => StoreError::AlreadyExists {
            entity: EntityKind::Participation,
            id: p.id.to_string(),
        },
        None => database(e),
    })?;
    Ok(())
}

async fn update_participation(conn: &mut PgConnection, p: &Participation) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE participations SET version = version + 1, status = $3, joined_at = $4, updated_at = now() \
         WHERE id = $1 AND version = $2",
    )
    .bind(p.id.as_uuid())
    .bind(to_bigint(p.version)?)
    .bind(p.status.as_str())
    .bind(p.joined_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match unique_violation(&e) {
        Some(_) => StoreError::DuplicateParticipation,
        None => database(e),
    })?;

    if result.rows_affected() == 1 {
        return Ok(());
    }
    let actual = stored_version(
        conn,
        "SELECT version FROM participations WHERE id = $1",
        *p.id.as_uuid(),
    )
    .await?;
    Err(StoreError::VersionConflict {
        entity: EntityKind::Participation,
        id: p.id.to_string(),
        expected: p.version,
        actual,
    })
}

async fn stored_version(
    conn: &mut PgConnection,
    sql: &'static str,
    id: Uuid,
) -> Result<Option<Version>, StoreError> {
    let raw: Option<i64> = sqlx::query_scalar(sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(database)?;
    raw.map(from_bigint).transpose()
}

fn match_from_row(row: &PgRow) -> Result<Match, StoreError> {
    let status: String = row.try_get("status").map_err(database)?;
    let date: NaiveDate = row.try_get("match_date").map_err(database)?;
    let start_time: NaiveTime = row.try_get("start_time").map_err(database)?;
    let end_time: NaiveTime = row.try_get("end_time").map_err(database)?;
    let longitude: f64 = row.try_get("longitude").map_err(database)?;
    let latitude: f64 = row.try_get("latitude").map_err(database)?;

    Ok(Match {
        id: MatchId::from_uuid(row.try_get("id").map_err(database)?),
        version: from_bigint(row.try_get("version").map_err(database)?)?,
        host_id: UserId::from_uuid(row.try_get("host_id").map_err(database)?),
        title: row.try_get("title").map_err(database)?,
        description: row.try_get("description").map_err(database)?,
        address: row.try_get("address").map_err(database)?,
        location: GeoPoint::new(longitude, latitude).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        schedule: MatchSchedule::new(date, start_time, end_time)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        max_participants: from_int(row.try_get("max_participants").map_err(database)?)?,
        current_participants: from_int(row.try_get("current_participants").map_err(database)?)?,
        status: status
            .parse::<MatchStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        cancelled_at: row.try_get("cancelled_at").map_err(database)?,
    })
}

fn participation_from_row(row: &PgRow) -> Result<Participation, StoreError> {
    let status: String = row.try_get("status").map_err(database)?;
    Ok(Participation {
        id: ParticipationId::from_uuid(row.try_get("id").map_err(database)?),
        version: from_bigint(row.try_get("version").map_err(database)?)?,
        match_id: MatchId::from_uuid(row.try_get("match_id").map_err(database)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(database)?),
        status: status
            .parse::<ParticipationStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        joined_at: row.try_get("joined_at").map_err(database)?,
    })
}

/// Constraint name of a unique violation, if `err` is one.
fn unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

fn database(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn to_bigint(version: Version) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_bigint(raw: i64) -> Result<Version, StoreError> {
    Version::try_from(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn to_int(count: u32) -> Result<i32, StoreError> {
    i32::try_from(count).map_err(|_| StoreError::Corrupt(format!("participant count {count} out of range")))
}

fn from_int(raw: i32) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Corrupt(format!("negative participant count {raw}")))
}

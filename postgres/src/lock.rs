//! Lock table in the `ShedLock` layout.
//!
//! A row is free once `lock_until` has passed. Acquisition is a single upsert
//! that only overwrites an expired row, so two instances can never both see
//! `RETURNING` produce a row for the same live lease.

use chrono::{DateTime, Utc};
use matchup_core::environment::Clock;
use matchup_core::lock::{DistributedLock, LockError, LockFuture, LockLease, LockRequest};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// [`DistributedLock`] over the `shedlock` table.
///
/// Timestamps come from the injected clock, so instances should run NTP; the
/// minimum hold (`at_least`) absorbs small skews between them.
#[derive(Clone)]
pub struct PostgresLock {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    instance: String,
}

impl PostgresLock {
    /// Create a lock client. `instance` is recorded in `locked_by` for operators.
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, instance: impl Into<String>) -> Self {
        Self {
            pool,
            clock,
            instance: instance.into(),
        }
    }

    /// Current holder of `name`, if the lease is live.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the query fails.
    pub async fn holder(&self, name: &str) -> Result<Option<String>, LockError> {
        sqlx::query_scalar("SELECT locked_by FROM shedlock WHERE name = $1 AND lock_until > $2")
            .bind(name)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
    }
}

impl DistributedLock for PostgresLock {
    fn try_acquire(&self, request: LockRequest) -> LockFuture<'_, Option<LockLease>> {
        Box::pin(async move {
            request.validate()?;
            let now = self.clock.now();
            let expires_at = now + to_chrono(request.at_most)?;
            let hold_until = now + to_chrono(request.at_least)?;
            let token = format!("{}/{}", self.instance, Uuid::new_v4());

            let acquired: Option<String> = sqlx::query_scalar(
                "INSERT INTO shedlock (name, lock_until, locked_at, locked_by) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (name) DO UPDATE \
                 SET lock_until = EXCLUDED.lock_until, locked_at = EXCLUDED.locked_at, locked_by = EXCLUDED.locked_by \
                 WHERE shedlock.lock_until <= EXCLUDED.locked_at \
                 RETURNING name",
            )
            .bind(&request.name)
            .bind(expires_at)
            .bind(now)
            .bind(&token)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

            if acquired.is_none() {
                return Ok(None);
            }
            tracing::debug!(lock = %request.name, token = %token, "Lock acquired");
            Ok(Some(LockLease {
                name: request.name,
                token,
                acquired_at: now,
                expires_at,
                hold_until,
            }))
        })
    }

    fn release(&self, lease: LockLease) -> LockFuture<'_, ()> {
        Box::pin(async move {
            let until: DateTime<Utc> = lease.hold_until.max(self.clock.now());
            let result = sqlx::query("UPDATE shedlock SET lock_until = $3 WHERE name = $1 AND locked_by = $2")
                .bind(&lease.name)
                .bind(&lease.token)
                .bind(until)
                .execute(&self.pool)
                .await
                .map_err(backend)?;

            if result.rows_affected() == 0 {
                tracing::debug!(lock = %lease.name, "Lease was already taken over; nothing to release");
            }
            Ok(())
        })
    }
}

fn to_chrono(d: std::time::Duration) -> Result<chrono::Duration, LockError> {
    chrono::Duration::from_std(d).map_err(|e| LockError::InvalidRequest(e.to_string()))
}

fn backend(err: sqlx::Error) -> LockError {
    LockError::Backend(err.to_string())
}

//! Expiring lock on a single Redis key.
//!
//! Acquire is `SET lock:{name} {token} NX PX {at_most}`. Release runs a script that
//! only touches the key while it still holds the caller's token, and shortens the
//! expiry to the remaining minimum hold instead of deleting when that is still ahead.

use chrono::{DateTime, Utc};
use matchup_core::environment::Clock;
use matchup_core::lock::{DistributedLock, LockError, LockFuture, LockLease, LockRequest};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::Arc;
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
local hold = tonumber(ARGV[2])
if hold > 0 then
    redis.call('PEXPIRE', KEYS[1], hold)
else
    redis.call('DEL', KEYS[1])
end
return 1
";

/// `Redis`-backed [`DistributedLock`].
///
/// Expiry is enforced by Redis itself; the injected clock only stamps leases and
/// computes the remaining minimum hold on release.
#[derive(Clone)]
pub struct RedisLock {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    clock: Arc<dyn Clock>,
    release: Script,
}

impl RedisLock {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the connection fails.
    pub async fn new(redis_url: &str, clock: Arc<dyn Clock>) -> Result<Self, LockError> {
        let client = Client::open(redis_url)
            .map_err(|e| LockError::Backend(format!("Failed to create Redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            LockError::Backend(format!("Failed to create Redis connection manager: {e}"))
        })?;
        Ok(Self::from_manager(conn_manager, clock))
    }

    /// Share an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn_manager,
            clock,
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn lock_key(name: &str) -> String {
        format!("lock:{name}")
    }
}

impl DistributedLock for RedisLock {
    fn try_acquire(&self, request: LockRequest) -> LockFuture<'_, Option<LockLease>> {
        Box::pin(async move {
            request.validate()?;
            let mut conn = self.conn_manager.clone();
            let now = self.clock.now();
            let token = Uuid::new_v4().to_string();

            let reply: Option<String> = redis::cmd("SET")
                .arg(Self::lock_key(&request.name))
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(millis(request.at_most))
                .query_async(&mut conn)
                .await
                .map_err(backend)?;

            if reply.is_none() {
                return Ok(None);
            }
            tracing::debug!(lock = %request.name, "Lock acquired");
            Ok(Some(LockLease {
                expires_at: now + to_chrono(request.at_most)?,
                hold_until: now + to_chrono(request.at_least)?,
                name: request.name,
                token,
                acquired_at: now,
            }))
        })
    }

    fn release(&self, lease: LockLease) -> LockFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let remaining_ms = remaining_hold_ms(lease.hold_until, self.clock.now());

            let released: i64 = self
                .release
                .key(Self::lock_key(&lease.name))
                .arg(&lease.token)
                .arg(remaining_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(backend)?;

            if released == 0 {
                tracing::debug!(lock = %lease.name, "Lease expired or taken over; nothing to release");
            }
            Ok(())
        })
    }
}

fn remaining_hold_ms(hold_until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (hold_until - now).num_milliseconds().max(0)
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn to_chrono(d: std::time::Duration) -> Result<chrono::Duration, LockError> {
    chrono::Duration::from_std(d).map_err(|e| LockError::InvalidRequest(e.to_string()))
}

fn backend(err: redis::RedisError) -> LockError {
    LockError::Backend(err.to_string())
}

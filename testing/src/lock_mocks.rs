//! In-memory distributed lock driven by an injected clock.

use chrono::{DateTime, Utc};
use matchup_core::environment::Clock;
use matchup_core::lock::{DistributedLock, LockError, LockFuture, LockLease, LockRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug)]
struct Held {
    token: String,
    lock_until: DateTime<Utc>,
}

/// [`DistributedLock`] shared by clones, so several "instances" in one test can
/// contend for the same names. Expiry follows the injected [`Clock`], which makes
/// crash-and-expire scenarios deterministic with a `ManualClock`.
#[derive(Clone)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, Held>>>,
    clock: Arc<dyn Clock>,
    next_token: Arc<AtomicU64>,
}

impl InMemoryLock {
    /// Create a lock table reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            clock,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, Held>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `name` is held right now.
    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        let now = self.clock.now();
        self.held().get(name).is_some_and(|h| h.lock_until > now)
    }
}

fn to_chrono(d: std::time::Duration) -> Result<chrono::Duration, LockError> {
    chrono::Duration::from_std(d).map_err(|e| LockError::InvalidRequest(e.to_string()))
}

impl DistributedLock for InMemoryLock {
    fn try_acquire(&self, request: LockRequest) -> LockFuture<'_, Option<LockLease>> {
        Box::pin(async move {
            request.validate()?;
            let now = self.clock.now();
            let mut held = self.held();

            if held.get(&request.name).is_some_and(|h| h.lock_until > now) {
                return Ok(None);
            }

            let token = format!("lease-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
            let expires_at = now + to_chrono(request.at_most)?;
            held.insert(
                request.name.clone(),
                Held {
                    token: token.clone(),
                    lock_until: expires_at,
                },
            );
            Ok(Some(LockLease {
                name: request.name,
                token,
                acquired_at: now,
                expires_at,
                hold_until: now + to_chrono(request.at_least)?,
            }))
        })
    }

    fn release(&self, lease: LockLease) -> LockFuture<'_, ()> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut held = self.held();
            let owned = held.get(&lease.name).is_some_and(|h| h.token == lease.token);
            if !owned {
                return Ok(());
            }
            if lease.hold_until > now {
                if let Some(h) = held.get_mut(&lease.name) {
                    h.lock_until = lease.hold_until;
                }
            } else {
                held.remove(&lease.name);
            }
            Ok(())
        })
    }
}

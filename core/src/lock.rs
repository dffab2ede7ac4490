//! Cluster-wide named lock with expiry.
//!
//! The lock is the only blocking mutual-exclusion primitive in the system. It guards
//! background passes (lifecycle scheduling, index reconciliation) that must run on at
//! most one instance at a time. Every lease expires, so a crashed holder cannot stall
//! the cluster.
//!
//! Two durations shape a lease:
//!
//! - `at_most`: the hard expiry, no shorter than the longest expected pass.
//! - `at_least`: releasing earlier than this keeps the lock until `acquired_at + at_least`,
//!   which stops instances with skewed clocks from running the same periodic pass twice.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by lock methods.
pub type LockFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LockError>> + Send + 'a>>;

/// Errors from the lock backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Backend unreachable or command failed.
    #[error("Lock backend error: {0}")]
    Backend(String),

    /// Requested durations are inconsistent.
    #[error("Invalid lock request: {0}")]
    InvalidRequest(String),
}

/// What to acquire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRequest {
    /// Lock name shared by all instances
    pub name: String,
    /// Hard expiry
    pub at_most: Duration,
    /// Minimum hold time
    pub at_least: Duration,
}

impl LockRequest {
    /// Create a request.
    #[must_use]
    pub fn new(name: impl Into<String>, at_most: Duration, at_least: Duration) -> Self {
        Self {
            name: name.into(),
            at_most,
            at_least,
        }
    }

    /// Check `at_least <= at_most` and `at_most > 0`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidRequest`] otherwise.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.at_most.is_zero() {
            return Err(LockError::InvalidRequest(format!(
                "lock '{}' needs a non-zero expiry",
                self.name
            )));
        }
        if self.at_least > self.at_most {
            return Err(LockError::InvalidRequest(format!(
                "lock '{}' minimum hold exceeds expiry",
                self.name
            )));
        }
        Ok(())
    }
}

/// A held lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockLease {
    /// Lock name
    pub name: String,
    /// Owner token; only this token may release
    pub token: String,
    /// When the lease was granted
    pub acquired_at: DateTime<Utc>,
    /// Hard expiry
    pub expires_at: DateTime<Utc>,
    /// Earliest instant a release actually frees the lock
    pub hold_until: DateTime<Utc>,
}

/// Named, expiring, cluster-wide lock.
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock without waiting. `Ok(None)` means another holder has it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] if the backend fails or the request is invalid.
    fn try_acquire(&self, request: LockRequest) -> LockFuture<'_, Option<LockLease>>;

    /// Release a lease. Keeps the lock until `hold_until` if that is still ahead.
    /// Releasing a lease that expired or was taken over is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the backend fails.
    fn release(&self, lease: LockLease) -> LockFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_durations() {
        let ok = LockRequest::new("x", Duration::from_secs(300), Duration::from_secs(50));
        assert!(ok.validate().is_ok());

        let inverted = LockRequest::new("x", Duration::from_secs(10), Duration::from_secs(50));
        assert!(inverted.validate().is_err());

        let zero = LockRequest::new("x", Duration::ZERO, Duration::ZERO);
        assert!(zero.validate().is_err());
    }
}

//! Bounded retry with doubling, jittered backoff.
//!
//! [`CapacityCoordinator`](crate::capacity::CapacityCoordinator) sleeps between
//! compare-and-set attempts with [`RetryPolicy::jittered_delay`]. Host operations
//! retry version conflicts through [`retry_with_predicate`], and the after-commit
//! publisher and the index synchronizer wrap I/O in [`retry_with_backoff`].
//!
//! The delay before retry `n` (zero-based) is `initial_delay * 2^n`, capped at
//! `max_delay`; with [`Jitter::Full`] the sleep is uniform in `[0, that]`.
//!
//! # Example
//!
//! ```rust
//! use matchup_runtime::retry::{Jitter, RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(4)
//!     .initial_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_millis(500))
//!     .jitter(Jitter::Full)
//!     .build();
//!
//! let result = retry_with_backoff(policy, || async move { Ok::<_, String>(42) }).await?;
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// How the computed backoff is randomised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Sleep exactly the capped delay.
    None,
    /// Sleep a uniform random duration in `[0, delay]`.
    #[default]
    Full,
}

/// Retry budget and backoff shape.
///
/// Defaults: three retries (four attempts), 50ms base, 500ms cap, full jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first try
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for the doubled delay
    pub max_delay: Duration,
    /// Randomisation on top of the capped delay
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    /// Start from the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Total attempts including the first one.
    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Capped delay before zero-based retry `retry`, without jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift));
        factor
            .and_then(|f| self.initial_delay.checked_mul(f))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// The delay actually slept: [`Self::delay_for_attempt`] after jitter.
    #[must_use]
    pub fn jittered_delay(&self, retry: usize) -> Duration {
        let ceiling = self.delay_for_attempt(retry);
        match self.jitter {
            Jitter::None => ceiling,
            Jitter::Full => {
                let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
            }
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first try.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Total attempts; zero is treated as one.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.policy.max_retries = max_attempts.saturating_sub(1);
        self
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound for any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Jitter mode.
    #[must_use]
    pub const fn jitter(mut self, jitter: Jitter) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Retry `operation` on every error until the budget is spent.
///
/// # Errors
///
/// The operation's last error once `policy.max_retries` retries have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry `operation` while `is_retryable` accepts the error.
///
/// Errors the predicate rejects are returned at once, without sleeping.
///
/// # Errors
///
/// The first non-retryable error, or the last error once the budget is spent.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::debug!(retries = retry, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }
        if retry >= policy.max_retries {
            tracing::error!(attempts = retry + 1, error = %err, "Giving up after retry budget");
            return Err(err);
        }

        let delay = policy.jittered_delay(retry);
        tracing::warn!(
            attempt = retry + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn no_wait(max_retries: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::ZERO)
            .jitter(Jitter::None)
            .build()
    }

    #[test]
    fn delays_double_until_the_cap() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(50))
            .max_delay(Duration::from_millis(500))
            .jitter(Jitter::None)
            .build();

        let delays: Vec<u128> = (0..6).map(|n| policy.delay_for_attempt(n).as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200, 400, 500, 500]);
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(500));
        assert_eq!(policy.jittered_delay(2), Duration::from_millis(200));
    }

    #[test]
    fn full_jitter_never_exceeds_the_capped_delay() {
        let policy = RetryPolicy::default();
        for retry in 0..8 {
            for _ in 0..50 {
                assert!(policy.jittered_delay(retry) <= policy.delay_for_attempt(retry));
            }
        }
    }

    #[test]
    fn max_attempts_counts_the_first_try() {
        let policy = RetryPolicy::builder().max_attempts(4).build();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(RetryPolicy::builder().max_attempts(0).build().max_attempts(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = &AtomicUsize::new(0);

        let result = retry_with_backoff(no_wait(3), || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err("broker unavailable"),
                _ => Ok("published"),
            }
        })
        .await;

        assert_eq!(result, Ok("published"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_bounds_the_number_of_calls() {
        let calls = &AtomicUsize::new(0);

        let result = retry_with_backoff(no_wait(2), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("version conflict")
        })
        .await;

        assert_eq!(result, Err("version conflict"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_errors_fail_fast() {
        let calls = &AtomicUsize::new(0);

        let result = retry_with_predicate(
            no_wait(5),
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("not the host")
            },
            |err: &&str| err.contains("conflict"),
        )
        .await;

        assert_eq!(result, Err("not the host"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

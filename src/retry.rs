// src/retry.rs
//! Retry-with-backoff shared by the RPC pool and any other caller that needs the same policy.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::jitter;
use tokio_retry::Retry;

use crate::settings;

/// Bounded exponential backoff: `base, 2*base, 4*base, ...` capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&settings::Retry::default())
    }
}

impl From<&settings::Retry> for RetryPolicy {
    fn from(cfg: &settings::Retry) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: cfg.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry `n` (0-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The sleeps taken between attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let policy = *self;
        (0..policy.max_attempts.saturating_sub(1)).map(move |n| {
            let d = policy.delay_for(n);
            if policy.jitter {
                jitter(d)
            } else {
                d
            }
        })
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|n| self.delay_for(n))
            .sum()
    }
}

/// Runs `action` up to `policy.max_attempts` times, sleeping per the policy between
/// failures. Returns the first success or the last error.
pub async fn retry_with_backoff<A, Fut, T, E>(policy: &RetryPolicy, action: A) -> Result<T, E>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    Retry::start(policy.delays(), action).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(300));
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
        assert_eq!(policy.max_total_delay(), Duration::from_millis(900));
    }

    #[test]
    fn test_single_attempt_has_no_delays() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delays().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));

        let result: Result<u32, String> = retry_with_backoff(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(format!("attempt {} failed", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));

        let result: Result<(), String> = retry_with_backoff(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {} failed", n)) }
        })
        .await;

        assert_eq!(result, Err("attempt 2 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

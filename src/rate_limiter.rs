// src/rate_limiter.rs
//! Per-service minimum-interval gate.
//!
//! Every outbound call to a throttled provider goes through [`ServiceRateLimiter::wait_for_slot`].
//! The caller reserves the next free slot (`max(now, last + interval)`), stamps it as the
//! service's last-call time, then sleeps until that slot. Stamping happens before the
//! outbound request, so the gate applies even when the request itself fails, and
//! back-to-back callers are serialized at the configured rate without an explicit queue.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use crate::settings::PriceFeeds;

#[derive(Debug, Default)]
pub struct ServiceRateLimiter {
    intervals: DashMap<String, Duration>,
    /// Services without a configured interval use this one (zero = unthrottled).
    default_interval: Duration,
    last_call: DashMap<String, Instant>,
}

impl ServiceRateLimiter {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            intervals: DashMap::new(),
            default_interval,
            last_call: DashMap::new(),
        }
    }

    /// Builds a limiter from `{ service: interval_ms }`.
    pub fn with_intervals_ms(intervals: &HashMap<String, u64>) -> Self {
        let limiter = Self::new(Duration::ZERO);
        for (service, ms) in intervals {
            limiter.set_interval(service, Duration::from_millis(*ms));
        }
        limiter
    }

    pub fn from_settings(settings: &PriceFeeds) -> Self {
        Self::with_intervals_ms(&settings.rate_limits)
    }

    pub fn set_interval(&self, service: &str, interval: Duration) {
        self.intervals.insert(service.to_lowercase(), interval);
    }

    pub fn interval_for(&self, service: &str) -> Duration {
        self.intervals
            .get(&service.to_lowercase())
            .map(|d| *d)
            .unwrap_or(self.default_interval)
    }

    /// Last stamped call time for `service`. May lie in the future while a reserved slot
    /// is still being waited on.
    pub fn last_call(&self, service: &str) -> Option<Instant> {
        self.last_call.get(&service.to_lowercase()).map(|t| *t)
    }

    /// Waits until `service` may be called again. Returns how long the caller was delayed.
    pub async fn wait_for_slot(&self, service: &str) -> Duration {
        let key = service.to_lowercase();
        let interval = self.interval_for(&key);
        let now = Instant::now();

        let slot = match self.last_call.entry(key) {
            Entry::Occupied(mut occupied) => {
                let earliest = *occupied.get() + interval;
                let slot = if earliest > now { earliest } else { now };
                *occupied.get_mut() = slot;
                slot
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                now
            }
        };

        let delay = slot.saturating_duration_since(now);
        if !delay.is_zero() {
            debug!("rate limiter: delaying {} call by {:?}", service, delay);
            sleep_until(slot).await;
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_calls_are_spaced() {
        let limiter = ServiceRateLimiter::new(Duration::ZERO);
        limiter.set_interval("birdeye", Duration::from_millis(200));

        let first_started = Instant::now();
        assert_eq!(limiter.wait_for_slot("birdeye").await, Duration::ZERO);
        limiter.wait_for_slot("birdeye").await;
        assert!(first_started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_after_interval_elapsed() {
        let limiter = ServiceRateLimiter::new(Duration::ZERO);
        limiter.set_interval("birdeye", Duration::from_millis(200));

        limiter.wait_for_slot("birdeye").await;
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(limiter.wait_for_slot("birdeye").await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_are_independent_and_unknown_is_unthrottled() {
        let limiter = ServiceRateLimiter::new(Duration::ZERO);
        limiter.set_interval("birdeye", Duration::from_millis(200));

        limiter.wait_for_slot("birdeye").await;
        assert_eq!(limiter.wait_for_slot("coingecko").await, Duration::ZERO);
        assert_eq!(limiter.wait_for_slot("coingecko").await, Duration::ZERO);
        assert!(limiter.last_call("coingecko").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialized() {
        let limiter = Arc::new(ServiceRateLimiter::new(Duration::ZERO));
        limiter.set_interval("birdeye", Duration::from_millis(100));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.wait_for_slot("birdeye").await;
                    Instant::now()
                })
            })
            .collect();

        let mut released = Vec::new();
        for h in handles {
            released.push(h.await.unwrap().duration_since(start));
        }
        released.sort();
        assert_eq!(
            released,
            vec![Duration::ZERO, Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn test_from_settings_uses_configured_intervals() {
        let limiter = ServiceRateLimiter::from_settings(&PriceFeeds::default());
        assert_eq!(limiter.interval_for("Birdeye"), Duration::from_millis(200));
        assert_eq!(limiter.interval_for("jupiter"), Duration::ZERO);
    }
}

//! Request-level rate limiting.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::key::ClientKey;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request was admitted (and recorded).
    pub allowed: bool,
    /// Requests counted in the window after this call.
    pub current: u32,
    /// Time until a slot frees up, when denied.
    pub retry_after: Option<Duration>,
}

/// Sliding window request timestamps for rate limiting.
#[derive(Debug, Default)]
struct SlidingWindow {
    /// Admitted request timestamps, oldest first.
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    /// Drop timestamps that are no longer strictly inside the window.
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.timestamps.front().is_some_and(|t| *t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Prune, then record `now` if under `max`.
    fn try_request(&mut self, now: DateTime<Utc>, window: Duration, max: u32) -> bool {
        self.prune(now, window);
        if (self.timestamps.len() as u32) < max {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    fn retry_after(&self, now: DateTime<Utc>, window: Duration) -> Option<Duration> {
        self.timestamps
            .front()
            .map(|oldest| *oldest + window - now)
            .filter(|d| *d > Duration::zero())
    }

    fn len(&self) -> u32 {
        self.timestamps.len() as u32
    }
}

/// Per-client sliding window limiter.
///
/// Each key's prune-compare-append sequence runs under that key's shard
/// lock, so concurrent requests for one key never over-admit while
/// unrelated keys proceed in parallel.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum requests per window.
    max_requests: u32,
    /// Window size.
    window: Duration,
    /// Sliding windows per client.
    windows: DashMap<ClientKey, SlidingWindow>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    /// Check whether a request is admitted and record it if so.
    ///
    /// Denied attempts are not recorded, so hammering a full window does not
    /// push the client's recovery further out.
    pub fn admit(&self, key: &ClientKey, now: DateTime<Utc>) -> RateDecision {
        let mut window = self.windows.entry(key.clone()).or_default();

        if window.try_request(now, self.window, self.max_requests) {
            debug!(key = %key, count = window.len(), "Request admitted");
            RateDecision {
                allowed: true,
                current: window.len(),
                retry_after: None,
            }
        } else {
            debug!(key = %key, max = self.max_requests, "Rate limit exceeded");
            RateDecision {
                allowed: false,
                current: window.len(),
                retry_after: window.retry_after(now, self.window),
            }
        }
    }

    /// Current request count for a client.
    #[must_use]
    pub fn current_count(&self, key: &ClientKey, now: DateTime<Utc>) -> u32 {
        self.windows.get_mut(key).map_or(0, |mut w| {
            w.prune(now, self.window);
            w.len()
        })
    }

    /// Number of clients with at least one request inside the window at `now`.
    #[must_use]
    pub fn active_buckets(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        self.windows
            .iter()
            .filter(|w| w.timestamps.back().is_some_and(|t| *t > cutoff))
            .count()
    }

    /// Number of buckets held in memory, including emptied ones not yet swept.
    #[must_use]
    pub fn tracked_buckets(&self) -> usize {
        self.windows.len()
    }

    /// Remove tracking for a client.
    pub fn remove(&self, key: &ClientKey) {
        self.windows.remove(key);
    }

    /// Clear all tracking.
    pub fn clear(&self) {
        self.windows.clear();
    }

    /// Drop buckets that have no timestamps left in the window.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.prune(now, self.window);
            !w.timestamps.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed = removed, "Swept idle rate-limit buckets");
        }
        removed
    }

    /// Get the max requests per window.
    #[must_use]
    pub const fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Get the window size.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn key(s: &str) -> ClientKey {
        ClientKey::new(s)
    }

    #[test]
    fn test_allows_under_limit() {
        let limiter = RateLimiter::new(3, Duration::seconds(60));
        let now = Utc::now();

        for i in 1..=3 {
            let decision = limiter.admit(&key("1.2.3.4"), now);
            assert!(decision.allowed);
            assert_eq!(decision.current, i);
        }
    }

    #[test]
    fn test_blocks_over_limit_without_recording() {
        let limiter = RateLimiter::new(2, Duration::seconds(60));
        let now = Utc::now();
        let k = key("1.2.3.4");

        assert!(limiter.admit(&k, now).allowed);
        assert!(limiter.admit(&k, now).allowed);

        let denied = limiter.admit(&k, now);
        assert!(!denied.allowed);
        assert_eq!(denied.current, 2);
        assert_eq!(limiter.current_count(&k, now), 2);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::seconds(60));
        let start = Utc::now();
        let k = key("1.2.3.4");

        assert!(limiter.admit(&k, start).allowed);
        assert!(limiter.admit(&k, start + Duration::seconds(30)).allowed);
        assert!(!limiter.admit(&k, start + Duration::seconds(59)).allowed);

        // The first request is exactly one window old and no longer counts.
        assert!(limiter.admit(&k, start + Duration::seconds(60)).allowed);
        assert!(!limiter.admit(&k, start + Duration::seconds(61)).allowed);
    }

    #[test]
    fn test_denied_attempts_do_not_ratchet() {
        let limiter = RateLimiter::new(1, Duration::seconds(10));
        let start = Utc::now();
        let k = key("1.2.3.4");

        assert!(limiter.admit(&k, start).allowed);
        for s in 1..10 {
            assert!(!limiter.admit(&k, start + Duration::seconds(s)).allowed);
        }
        assert!(limiter.admit(&k, start + Duration::seconds(10)).allowed);
    }

    #[test]
    fn test_retry_after() {
        let limiter = RateLimiter::new(1, Duration::seconds(60));
        let start = Utc::now();
        let k = key("1.2.3.4");

        limiter.admit(&k, start);
        let denied = limiter.admit(&k, start + Duration::seconds(20));
        assert_eq!(denied.retry_after, Some(Duration::seconds(40)));
    }

    #[test]
    fn test_multiple_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::seconds(60));
        let now = Utc::now();

        assert!(limiter.admit(&key("1.2.3.4"), now).allowed);
        assert!(!limiter.admit(&key("1.2.3.4"), now).allowed);
        assert!(limiter.admit(&key("5.6.7.8"), now).allowed);
        assert!(limiter.admit(&ClientKey::unknown(), now).allowed);
        assert_eq!(limiter.active_buckets(now), 3);
    }

    #[test]
    fn test_remove_clear_and_sweep() {
        let limiter = RateLimiter::new(10, Duration::seconds(60));
        let now = Utc::now();

        limiter.admit(&key("a"), now);
        limiter.admit(&key("b"), now + Duration::seconds(30));
        assert_eq!(limiter.tracked_buckets(), 2);

        assert_eq!(limiter.sweep(now + Duration::seconds(61)), 1);
        assert_eq!(limiter.tracked_buckets(), 1);

        limiter.remove(&key("b"));
        assert_eq!(limiter.tracked_buckets(), 0);

        limiter.admit(&key("c"), now);
        limiter.clear();
        assert_eq!(limiter.tracked_buckets(), 0);
    }

    #[test]
    fn test_active_buckets_ignore_emptied_windows() {
        let limiter = RateLimiter::new(10, Duration::seconds(60));
        let now = Utc::now();

        limiter.admit(&key("a"), now);
        limiter.admit(&key("b"), now + Duration::seconds(30));

        let later = now + Duration::seconds(61);
        assert_eq!(limiter.active_buckets(later), 1);
        assert_eq!(limiter.tracked_buckets(), 2);
        assert_eq!(limiter.active_buckets(now + Duration::seconds(91)), 0);
    }

    #[test]
    fn test_concurrent_admits_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(50, Duration::seconds(60)));
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.admit(&ClientKey::new("K"), now).allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    proptest! {
        #[test]
        fn prop_admitted_within_any_window_never_exceeds_max(
            max in 1u32..10,
            offsets in proptest::collection::vec(0i64..300, 1..80),
        ) {
            let window = Duration::seconds(60);
            let limiter = RateLimiter::new(max, window);
            let start = Utc::now();
            let k = ClientKey::new("K");

            let mut sorted = offsets;
            sorted.sort_unstable();

            let admitted: Vec<i64> = sorted
                .into_iter()
                .filter(|s| limiter.admit(&k, start + Duration::seconds(*s)).allowed)
                .collect();

            for (i, t) in admitted.iter().enumerate() {
                let in_window = admitted[i..].iter().filter(|u| **u - *t < 60).count();
                prop_assert!(in_window as u32 <= max);
            }
        }
    }
}

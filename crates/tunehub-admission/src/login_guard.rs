//! Login failure tracking and lockout.
//!
//! Each client moves through `Clear → Accumulating(n) → Locked(until)`.
//! A lock is inert once `now >= until` and is cleared lazily on the next
//! check. The failure count is reset only by a successful login (or an
//! administrative ban/unban), not by lock expiry, so a client whose lock
//! has lapsed is locked again by its next failure.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::LoginGuardConfig;
use crate::key::ClientKey;

/// Lock state reported for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    /// Whether login attempts are currently refused.
    pub locked: bool,
    /// Whole seconds until the lock lifts (0 when not locked).
    pub retry_after_secs: u64,
}

impl LockStatus {
    const UNLOCKED: Self = Self {
        locked: false,
        retry_after_secs: 0,
    };
}

/// Result of recording a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Failures left before a lock engages.
    pub attempts_remaining: u32,
    /// When the client's lock lifts, if one is active.
    pub locked_until: Option<DateTime<Utc>>,
}

/// Per-client failure record.
#[derive(Debug, Clone, Default)]
struct LoginAttemptRecord {
    failure_count: u32,
    locked_until: Option<DateTime<Utc>>,
}

impl LoginAttemptRecord {
    fn active_lock(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.locked_until.filter(|until| now < *until)
    }
}

/// Tracks failed logins per client and enforces lockouts.
#[derive(Debug)]
pub struct LoginGuard {
    max_attempts: u32,
    lockout: Duration,
    records: DashMap<ClientKey, LoginAttemptRecord>,
}

impl LoginGuard {
    /// Create a new guard.
    #[must_use]
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            max_attempts,
            lockout,
            records: DashMap::new(),
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &LoginGuardConfig) -> Self {
        Self::new(config.max_attempts, config.lockout())
    }

    /// Check whether a client is locked out.
    pub fn check_locked(&self, key: &ClientKey, now: DateTime<Utc>) -> LockStatus {
        let Some(mut record) = self.records.get_mut(key) else {
            return LockStatus::UNLOCKED;
        };

        match record.active_lock(now) {
            Some(until) => LockStatus {
                locked: true,
                retry_after_secs: ceil_secs(until - now),
            },
            None => {
                if record.locked_until.take().is_some() {
                    debug!(key = %key, "Login lock expired");
                }
                LockStatus::UNLOCKED
            }
        }
    }

    /// Record a failed login.
    pub fn record_failure(&self, key: &ClientKey, now: DateTime<Utc>) -> FailureOutcome {
        let mut record = self.records.entry(key.clone()).or_default();
        record.failure_count = record.failure_count.saturating_add(1);

        if record.failure_count >= self.max_attempts && record.active_lock(now).is_none() {
            let until = now + self.lockout;
            record.locked_until = Some(until);
            info!(
                key = %key,
                failures = record.failure_count,
                lockout_secs = self.lockout.num_seconds(),
                "Login locked out"
            );
        }

        FailureOutcome {
            attempts_remaining: self.max_attempts.saturating_sub(record.failure_count),
            locked_until: record.active_lock(now),
        }
    }

    /// Record a successful login, clearing the client's record.
    pub fn record_success(&self, key: &ClientKey) {
        if self.records.remove(key).is_some() {
            debug!(key = %key, "Login record cleared");
        }
    }

    /// Failures recorded for a client since its last success.
    #[must_use]
    pub fn failure_count(&self, key: &ClientKey) -> u32 {
        self.records.get(key).map_or(0, |r| r.failure_count)
    }

    /// Number of clients currently locked.
    #[must_use]
    pub fn locked_count(&self, now: DateTime<Utc>) -> usize {
        self.records
            .iter()
            .filter(|r| r.active_lock(now).is_some())
            .count()
    }

    /// Number of clients with a record.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    /// Forget a client entirely.
    pub fn remove(&self, key: &ClientKey) {
        self.records.remove(key);
    }

    /// Clear all records.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Clear lapsed lock timestamps eagerly. Failure counts are kept.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut cleared = 0;
        for mut record in self.records.iter_mut() {
            if record.locked_until.is_some() && record.active_lock(now).is_none() {
                record.locked_until = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Configured failures before lockout.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Configured lockout duration.
    #[must_use]
    pub const fn lockout(&self) -> Duration {
        self.lockout
    }
}

fn ceil_secs(d: Duration) -> u64 {
    u64::try_from(d.num_milliseconds())
        .unwrap_or(0)
        .div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> LoginGuard {
        LoginGuard::new(5, Duration::seconds(300))
    }

    fn key() -> ClientKey {
        ClientKey::new("1.2.3.4")
    }

    #[test]
    fn test_unknown_client_is_clear() {
        let guard = guard();
        assert_eq!(guard.check_locked(&key(), Utc::now()), LockStatus::UNLOCKED);
        assert_eq!(guard.failure_count(&key()), 0);
    }

    #[test]
    fn test_attempts_remaining_counts_down() {
        let guard = guard();
        let now = Utc::now();

        for expected in (1..5).rev() {
            let outcome = guard.record_failure(&key(), now);
            assert_eq!(outcome.attempts_remaining, expected);
            assert!(outcome.locked_until.is_none());
        }
        assert!(!guard.check_locked(&key(), now).locked);
    }

    #[test]
    fn test_locks_after_max_failures() {
        let guard = guard();
        let now = Utc::now();

        for _ in 0..5 {
            guard.record_failure(&key(), now);
        }

        let status = guard.check_locked(&key(), now);
        assert!(status.locked);
        assert_eq!(status.retry_after_secs, 300);
        assert_eq!(guard.locked_count(now), 1);

        let later = now + Duration::milliseconds(100_500);
        assert_eq!(guard.check_locked(&key(), later).retry_after_secs, 200);
    }

    #[test]
    fn test_lock_expires_lazily_but_count_is_kept() {
        let guard = guard();
        let now = Utc::now();
        for _ in 0..5 {
            guard.record_failure(&key(), now);
        }

        let after = now + Duration::seconds(300);
        assert!(!guard.check_locked(&key(), after).locked);
        assert_eq!(guard.failure_count(&key()), 5);
        assert_eq!(guard.locked_count(after), 0);

        // One more failure re-enters the lock immediately.
        let outcome = guard.record_failure(&key(), after);
        assert_eq!(outcome.attempts_remaining, 0);
        assert_eq!(outcome.locked_until, Some(after + Duration::seconds(300)));
        assert!(guard.check_locked(&key(), after).locked);
    }

    #[test]
    fn test_failures_while_locked_do_not_extend_lock() {
        let guard = guard();
        let now = Utc::now();
        for _ in 0..5 {
            guard.record_failure(&key(), now);
        }

        let outcome = guard.record_failure(&key(), now + Duration::seconds(100));
        assert_eq!(outcome.locked_until, Some(now + Duration::seconds(300)));
        assert_eq!(guard.failure_count(&key()), 6);
    }

    #[test]
    fn test_success_clears_record() {
        let guard = guard();
        let now = Utc::now();
        for _ in 0..5 {
            guard.record_failure(&key(), now);
        }

        guard.record_success(&key());
        assert!(!guard.check_locked(&key(), now).locked);
        assert_eq!(guard.failure_count(&key()), 0);
        assert_eq!(guard.tracked_count(), 0);
    }

    #[test]
    fn test_sweep_clears_lapsed_locks_only() {
        let guard = guard();
        let now = Utc::now();
        let other = ClientKey::new("5.6.7.8");
        for _ in 0..5 {
            guard.record_failure(&key(), now);
            guard.record_failure(&other, now + Duration::seconds(200));
        }

        assert_eq!(guard.sweep(now + Duration::seconds(300)), 1);
        assert_eq!(guard.locked_count(now + Duration::seconds(300)), 1);
        assert_eq!(guard.tracked_count(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let guard = guard();
        let now = Utc::now();
        guard.record_failure(&key(), now);
        guard.record_failure(&ClientKey::new("5.6.7.8"), now);

        guard.remove(&key());
        assert_eq!(guard.tracked_count(), 1);
        guard.clear();
        assert_eq!(guard.tracked_count(), 0);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::milliseconds(1)), 1);
        assert_eq!(ceil_secs(Duration::seconds(2)), 2);
        assert_eq!(ceil_secs(Duration::milliseconds(-5)), 0);
    }
}

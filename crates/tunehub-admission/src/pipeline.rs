//! The admission pipeline: one admit/deny decision per request.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::access_log::{AccessLogEntry, AccessLogger, STATUS_CLIENT_CLOSED, STATUS_FORBIDDEN};
use crate::agent::UserAgentClassifier;
use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionConfig, FailurePolicy};
use crate::error::{AdmissionError, AdmissionResult};
use crate::key::ClientKey;
use crate::login_guard::{FailureOutcome, LoginGuard};
use crate::rate_limit::RateLimiter;
use crate::reputation::{BanEntry, ReputationStore};

const OPS_TARGET: &str = "tunehub_admission::ops";

/// The request attributes the gate looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Client key (normally the source address).
    pub key: ClientKey,
    /// Request path, without query string.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// User-Agent header, if present.
    pub user_agent: Option<String>,
}

impl AdmissionRequest {
    /// Create a request without a User-Agent.
    pub fn new(key: impl Into<ClientKey>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            method: method.into(),
            user_agent: None,
        }
    }

    /// Attach a User-Agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    /// The client has a live ban.
    Banned,
    /// The User-Agent looks automated.
    SuspiciousAgent,
    /// Too many requests in the window.
    RateLimited,
    /// Too many failed logins.
    LockedOut,
    /// A store failed and the policy is fail-closed.
    StorageUnavailable,
}

impl DenyReason {
    /// Stable machine-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::SuspiciousAgent => "suspicious-agent",
            Self::RateLimited => "rate-limited",
            Self::LockedOut => "locked-out",
            Self::StorageUnavailable => "storage-unavailable",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Whether the request may proceed.
    pub allow: bool,
    /// Deny reason, when denied.
    pub reason: Option<DenyReason>,
    /// Coarse retry hint; only set for lockouts.
    pub retry_after_secs: Option<u64>,
}

impl Verdict {
    /// An allowing verdict.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            retry_after_secs: None,
        }
    }

    /// A denying verdict.
    #[must_use]
    pub const fn deny(reason: DenyReason) -> Self {
        Self {
            allow: false,
            reason: Some(reason),
            retry_after_secs: None,
        }
    }

    const fn locked_out(retry_after_secs: u64) -> Self {
        Self {
            allow: false,
            reason: Some(DenyReason::LockedOut),
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// HTTP status a caller should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        if self.allow { 200 } else { STATUS_FORBIDDEN }
    }

    /// Short user-facing explanation.
    #[must_use]
    pub fn message(&self) -> String {
        match (self.reason, self.retry_after_secs) {
            (None, _) => "ok".to_string(),
            (Some(DenyReason::LockedOut), Some(secs)) => {
                format!("Too many failed login attempts, retry after {secs} seconds")
            }
            (Some(DenyReason::LockedOut), None) => "Too many failed login attempts".to_string(),
            (Some(DenyReason::Banned), _) => "Access denied".to_string(),
            (Some(DenyReason::SuspiciousAgent), _) => {
                "Access denied: automated clients are not allowed".to_string()
            }
            (Some(DenyReason::RateLimited), _) => "Too many requests, please slow down".to_string(),
            (Some(DenyReason::StorageUnavailable), _) => {
                "Service temporarily unavailable".to_string()
            }
        }
    }
}

/// In-memory admission state, owned explicitly and injectable so tests and
/// multiple pipelines never share ambient globals.
#[derive(Debug)]
pub struct AdmissionState {
    rate_limiter: RateLimiter,
    login_guard: LoginGuard,
    /// Rate-limit denials per client, for escalation.
    strikes: DashMap<ClientKey, u32>,
}

impl AdmissionState {
    /// Create state sized from configuration.
    #[must_use]
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            login_guard: LoginGuard::from_config(&config.login_guard),
            strikes: DashMap::new(),
        }
    }

    /// The request limiter.
    #[must_use]
    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The login guard.
    #[must_use]
    pub const fn login_guard(&self) -> &LoginGuard {
        &self.login_guard
    }

    /// Forget everything tracked for `key`.
    pub fn clear_key(&self, key: &ClientKey) {
        self.rate_limiter.remove(key);
        self.login_guard.remove(key);
        self.strikes.remove(key);
    }

    /// Add a strike and return the new total.
    fn add_strike(&self, key: &ClientKey) -> u32 {
        let mut strikes = self.strikes.entry(key.clone()).or_insert(0);
        *strikes = strikes.saturating_add(1);
        *strikes
    }
}

/// Operational counters, separate from the access log.
#[derive(Debug, Default)]
struct AdmissionStats {
    evaluations: AtomicU64,
    denials: AtomicU64,
    storage_errors: AtomicU64,
    log_write_failures: AtomicU64,
    escalated_bans: AtomicU64,
}

/// Point-in-time copy of the operational counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Evaluations performed.
    pub evaluations: u64,
    /// Evaluations that denied.
    pub denials: u64,
    /// Reputation-store failures seen during evaluation or admin calls.
    pub storage_errors: u64,
    /// Access-log writes that failed.
    pub log_write_failures: u64,
    /// Bans issued by escalation.
    pub escalated_bans: u64,
}

#[derive(Debug)]
struct PipelineInner {
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    state: Arc<AdmissionState>,
    reputation: Arc<dyn ReputationStore>,
    logger: Arc<dyn AccessLogger>,
    classifier: UserAgentClassifier,
    stats: AdmissionStats,
}

impl PipelineInner {
    fn entry_for(&self, request: &AdmissionRequest, now: DateTime<Utc>, verdict: &Verdict) -> AccessLogEntry {
        AccessLogEntry {
            key: request.key.clone(),
            path: request.path.clone(),
            method: request.method.clone(),
            user_agent: AccessLogEntry::truncate_user_agent(
                request.user_agent.as_deref().unwrap_or_default(),
                self.config.access_log.user_agent_max_length,
            ),
            status_code: verdict.status_code(),
            timestamp: now,
            blocked: !verdict.allow,
            reason: verdict.reason.map(|r| r.as_str().to_string()),
        }
    }

    fn write_log(&self, entry: &AccessLogEntry) {
        if let Err(e) = self.logger.append(entry) {
            self.stats.log_write_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                target: OPS_TARGET,
                key = %entry.key,
                path = %entry.path,
                error = %e,
                "Access log write failed"
            );
        }
    }

    fn storage_error(&self, operation: &str, key: &ClientKey, err: &AdmissionError) {
        self.stats.storage_errors.fetch_add(1, Ordering::Relaxed);
        error!(
            target: OPS_TARGET,
            operation = operation,
            key = %key,
            error = %err,
            policy = ?self.config.failure_policy,
            "Reputation store failure"
        );
    }
}

/// The result of [`AdmissionPipeline::evaluate`].
#[derive(Debug)]
pub struct Admission {
    verdict: Verdict,
    ticket: Option<AdmissionTicket>,
}

impl Admission {
    /// The decision.
    #[must_use]
    pub const fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    /// Whether the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        self.verdict.allow
    }

    /// Split into the verdict and, for admitted requests, the ticket that
    /// must be completed once the handler has produced a status.
    #[must_use]
    pub fn into_parts(self) -> (Verdict, Option<AdmissionTicket>) {
        (self.verdict, self.ticket)
    }
}

/// Post-processing hook for an admitted request.
///
/// Call [`complete`](Self::complete) with the handler's status code. If the
/// ticket is dropped first (the request was cancelled), the access-log
/// record is still written, with status 499.
#[derive(Debug)]
#[must_use = "dropping a ticket logs the request as cancelled"]
pub struct AdmissionTicket {
    inner: Arc<PipelineInner>,
    entry: Option<AccessLogEntry>,
}

impl AdmissionTicket {
    /// The client this ticket belongs to.
    #[must_use]
    pub fn key(&self) -> Option<&ClientKey> {
        self.entry.as_ref().map(|e| &e.key)
    }

    /// Record the handler's status and write the access-log entry.
    pub fn complete(mut self, status_code: u16) {
        if let Some(mut entry) = self.entry.take() {
            entry.status_code = status_code;
            self.inner.write_log(&entry);
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            debug!(key = %entry.key, path = %entry.path, "Request cancelled before completion");
            entry.status_code = STATUS_CLIENT_CLOSED;
            self.inner.write_log(&entry);
        }
    }
}

/// Orchestrates ban lookup, agent classification, rate limiting and login
/// lockout into one verdict, and writes an access-log record for every
/// evaluation.
///
/// Checks run in a fixed order and stop at the first deny:
/// 1. Reputation store (ban)
/// 2. User-Agent classifier
/// 3. Rate limiter (rate-limited paths only)
/// 4. Login guard (login paths only)
///
/// Cloning is cheap; clones share all state.
#[derive(Debug, Clone)]
pub struct AdmissionPipeline {
    inner: Arc<PipelineInner>,
}

impl AdmissionPipeline {
    /// Create a pipeline with the system clock and fresh in-memory state.
    pub fn new(
        config: AdmissionConfig,
        reputation: Arc<dyn ReputationStore>,
        logger: Arc<dyn AccessLogger>,
    ) -> AdmissionResult<Self> {
        Self::builder(config, reputation, logger).build()
    }

    /// Start building a pipeline.
    pub fn builder(
        config: AdmissionConfig,
        reputation: Arc<dyn ReputationStore>,
        logger: Arc<dyn AccessLogger>,
    ) -> AdmissionPipelineBuilder {
        AdmissionPipelineBuilder {
            config,
            reputation,
            logger,
            clock: None,
            state: None,
        }
    }

    // ==================== Evaluation ====================

    /// Evaluate a request at the current time.
    pub fn evaluate(&self, request: &AdmissionRequest) -> Admission {
        self.evaluate_at(request, self.inner.clock.now())
    }

    /// Evaluate a request at `now`.
    pub fn evaluate_at(&self, request: &AdmissionRequest, now: DateTime<Utc>) -> Admission {
        self.inner.stats.evaluations.fetch_add(1, Ordering::Relaxed);

        let verdict = self.decide(request, now);
        let entry = self.inner.entry_for(request, now, &verdict);

        if verdict.allow {
            return Admission {
                verdict,
                ticket: Some(AdmissionTicket {
                    inner: Arc::clone(&self.inner),
                    entry: Some(entry),
                }),
            };
        }

        self.inner.stats.denials.fetch_add(1, Ordering::Relaxed);
        debug!(
            key = %request.key,
            path = %request.path,
            reason = ?verdict.reason,
            "Request denied"
        );
        self.inner.write_log(&entry);
        Admission {
            verdict,
            ticket: None,
        }
    }

    fn decide(&self, request: &AdmissionRequest, now: DateTime<Utc>) -> Verdict {
        let inner = &self.inner;
        let config = &inner.config;
        let key = &request.key;

        // 1. Ban check
        match inner.reputation.is_banned(key, now) {
            Ok(true) => return Verdict::deny(DenyReason::Banned),
            Ok(false) => {}
            Err(e) => {
                inner.storage_error("is_banned", key, &e);
                if config.failure_policy == FailurePolicy::FailClosed {
                    return Verdict::deny(DenyReason::StorageUnavailable);
                }
            }
        }

        // 2. User-Agent heuristics
        let agent = inner.classifier.classify(request.user_agent.as_deref());
        if agent.suspicious {
            debug!(key = %key, reason = %agent.reason, "Suspicious user agent");
            return Verdict::deny(DenyReason::SuspiciousAgent);
        }

        // 3. Sliding window
        if config.is_rate_limited_path(&request.path) {
            let decision = inner.state.rate_limiter.admit(key, now);
            if !decision.allowed {
                self.maybe_escalate(key, now);
                return Verdict::deny(DenyReason::RateLimited);
            }
        }

        // 4. Login lockout
        if config.is_login_path(&request.path) {
            let status = inner.state.login_guard.check_locked(key, now);
            if status.locked {
                return Verdict::locked_out(status.retry_after_secs);
            }
        }

        Verdict::allow()
    }

    fn maybe_escalate(&self, key: &ClientKey, now: DateTime<Utc>) {
        let escalation = &self.inner.config.escalation;
        if !escalation.enabled || key.is_unknown() {
            return;
        }

        // The strike guard is released before touching the store.
        let strikes = self.inner.state.add_strike(key);
        if strikes < escalation.strike_threshold {
            return;
        }

        info!(key = %key, strikes = strikes, "Escalating repeated rate-limit violations to a ban");
        match self.ban_at(
            key,
            "escalated: repeated rate-limit violations",
            escalation.ban_duration_hours,
            now,
        ) {
            Ok(_) => {
                self.inner.stats.escalated_bans.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(target: OPS_TARGET, key = %key, error = %e, "Escalated ban failed"),
        }
    }

    // ==================== Login Outcomes ====================

    /// Report the outcome of a credential check.
    ///
    /// Returns the failure bookkeeping for failed attempts, `None` for
    /// successes.
    pub fn report_login_outcome(&self, key: &ClientKey, succeeded: bool) -> Option<FailureOutcome> {
        self.report_login_outcome_at(key, succeeded, self.inner.clock.now())
    }

    /// Report the outcome of a credential check at `now`.
    pub fn report_login_outcome_at(
        &self,
        key: &ClientKey,
        succeeded: bool,
        now: DateTime<Utc>,
    ) -> Option<FailureOutcome> {
        let guard = &self.inner.state.login_guard;
        if succeeded {
            guard.record_success(key);
            None
        } else {
            let outcome = guard.record_failure(key, now);
            debug!(
                key = %key,
                attempts_remaining = outcome.attempts_remaining,
                "Login failure recorded"
            );
            Some(outcome)
        }
    }

    // ==================== Bans ====================

    /// Ban `key` for `duration_hours` (None = permanent), replacing any
    /// existing ban, and reset its rate-limit and login state.
    pub fn ban(
        &self,
        key: &ClientKey,
        reason: impl Into<String>,
        duration_hours: Option<u32>,
    ) -> AdmissionResult<BanEntry> {
        self.ban_at(key, reason, duration_hours, self.inner.clock.now())
    }

    fn ban_at(
        &self,
        key: &ClientKey,
        reason: impl Into<String>,
        duration_hours: Option<u32>,
        now: DateTime<Utc>,
    ) -> AdmissionResult<BanEntry> {
        if key.is_unknown() {
            return Err(AdmissionError::InvalidKey(key.to_string()));
        }
        let entry = BanEntry::new(key.clone(), reason, duration_hours, now)?;
        self.inner.reputation.ban(entry.clone()).inspect_err(|e| {
            self.inner.storage_error("ban", key, e);
        })?;
        self.inner.state.clear_key(key);
        Ok(entry)
    }

    /// Lift any ban on `key` and reset its rate-limit and login state.
    pub fn unban(&self, key: &ClientKey) -> AdmissionResult<bool> {
        if key.is_unknown() {
            return Err(AdmissionError::InvalidKey(key.to_string()));
        }
        let removed = self.inner.reputation.unban(key).inspect_err(|e| {
            self.inner.storage_error("unban", key, e);
        })?;
        self.inner.state.clear_key(key);
        Ok(removed)
    }

    /// Live bans, newest first.
    pub fn list_bans(&self) -> AdmissionResult<Vec<BanEntry>> {
        self.inner.reputation.list(self.inner.clock.now())
    }

    // ==================== Statistics ====================

    /// Number of clients with requests inside the current rate-limit window.
    #[must_use]
    pub fn active_rate_limit_buckets(&self) -> usize {
        self.inner
            .state
            .rate_limiter
            .active_buckets(self.inner.clock.now())
    }

    /// Number of clients currently locked out of login.
    #[must_use]
    pub fn locked_key_count(&self) -> usize {
        self.inner.state.login_guard.locked_count(self.inner.clock.now())
    }

    /// Operational counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.inner.stats;
        StatsSnapshot {
            evaluations: s.evaluations.load(Ordering::Relaxed),
            denials: s.denials.load(Ordering::Relaxed),
            storage_errors: s.storage_errors.load(Ordering::Relaxed),
            log_write_failures: s.log_write_failures.load(Ordering::Relaxed),
            escalated_bans: s.escalated_bans.load(Ordering::Relaxed),
        }
    }

    // ==================== Maintenance ====================

    /// Drop idle rate-limit buckets and lapsed lock timestamps.
    ///
    /// Optional: every read path already checks expiry.
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now();
        let state = &self.inner.state;
        state.rate_limiter.sweep(now) + state.login_guard.sweep(now)
    }

    // ==================== Accessors ====================

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// The in-memory state container.
    #[must_use]
    pub fn state(&self) -> &Arc<AdmissionState> {
        &self.inner.state
    }

    /// The clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }
}

/// Builder for [`AdmissionPipeline`].
#[derive(Debug)]
pub struct AdmissionPipelineBuilder {
    config: AdmissionConfig,
    reputation: Arc<dyn ReputationStore>,
    logger: Arc<dyn AccessLogger>,
    clock: Option<Arc<dyn Clock>>,
    state: Option<Arc<AdmissionState>>,
}

impl AdmissionPipelineBuilder {
    /// Use a custom clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an existing state container.
    #[must_use]
    pub fn state(mut self, state: Arc<AdmissionState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Validate the configuration and build the pipeline.
    pub fn build(self) -> AdmissionResult<AdmissionPipeline> {
        self.config.validate()?;

        let state = self
            .state
            .unwrap_or_else(|| Arc::new(AdmissionState::from_config(&self.config)));
        let classifier = UserAgentClassifier::from_config(&self.config.user_agent);

        info!(
            max_requests = self.config.rate_limit.max_requests,
            window_secs = self.config.rate_limit.window_secs,
            max_login_attempts = self.config.login_guard.max_attempts,
            lockout_secs = self.config.login_guard.lockout_secs,
            policy = ?self.config.failure_policy,
            "Admission pipeline ready"
        );

        Ok(AdmissionPipeline {
            inner: Arc::new(PipelineInner {
                config: self.config,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                state,
                reputation: self.reputation,
                logger: self.logger,
                classifier,
                stats: AdmissionStats::default(),
            }),
        })
    }
}

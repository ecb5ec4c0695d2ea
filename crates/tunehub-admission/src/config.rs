//! Admission configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, AdmissionResult};

/// Longest accepted rate-limit window or lockout, in seconds (one year).
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Longest accepted temporary ban, in hours (ten years).
pub const MAX_BAN_HOURS: u32 = 10 * 365 * 24;

/// User-Agent fragments that mark a client as automated.
pub const DEFAULT_SUSPICIOUS_TOKENS: &[&str] = &[
    // generic crawlers
    "bot",
    "crawler",
    "spider",
    "scraper",
    "scrapy",
    // HTTP clients and libraries
    "curl",
    "wget",
    "python-requests",
    "python-urllib",
    "httpx",
    "aiohttp",
    "go-http-client",
    "java/",
    "okhttp",
    "libwww-perl",
    "apache-httpclient",
    "axios",
    "node-fetch",
    "postman",
    "insomnia",
    // headless browsers and automation
    "headlesschrome",
    "phantomjs",
    "selenium",
    "webdriver",
    "puppeteer",
    "playwright",
];

/// Configuration for the sliding-window request limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum admitted requests per window per client.
    pub max_requests: u32,
    /// Window size in seconds.
    pub window_secs: u64,
    /// Paths the limiter applies to.
    pub path_prefixes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_secs: 60,
            path_prefixes: vec!["/api/".to_string()],
        }
    }
}

impl RateLimitConfig {
    /// The window as a chrono duration.
    #[must_use]
    pub fn window(&self) -> chrono::Duration {
        seconds(self.window_secs)
    }
}

/// Configuration for login failure lockout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginGuardConfig {
    /// Consecutive failures that trigger a lockout.
    pub max_attempts: u32,
    /// How long a lockout lasts, in seconds.
    pub lockout_secs: u64,
    /// Paths treated as login endpoints.
    pub path_prefixes: Vec<String>,
}

impl Default for LoginGuardConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_secs: 300,
            path_prefixes: vec!["/auth/login".to_string()],
        }
    }
}

impl LoginGuardConfig {
    /// The lockout as a chrono duration.
    #[must_use]
    pub fn lockout(&self) -> chrono::Duration {
        seconds(self.lockout_secs)
    }
}

/// Out-of-range values are clamped; `validate` rejects them before use.
fn seconds(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(i64::MAX);
    chrono::Duration::seconds(secs)
}

/// Configuration for the User-Agent classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentConfig {
    /// Case-insensitive substrings that mark an agent as suspicious.
    pub suspicious_tokens: Vec<String>,
    /// Whether a missing or blank User-Agent is itself suspicious.
    pub block_empty: bool,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            suspicious_tokens: DEFAULT_SUSPICIOUS_TOKENS
                .iter()
                .map(|t| (*t).to_string())
                .collect(),
            block_empty: true,
        }
    }
}

/// Configuration for access-log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Maximum number of characters of User-Agent kept per record.
    pub user_agent_max_length: usize,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            user_agent_max_length: 500,
        }
    }
}

/// Configuration for automatic ban escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Whether repeated rate-limit violations lead to a ban.
    pub enabled: bool,
    /// Rate-limit denials before the key is banned.
    pub strike_threshold: u32,
    /// Duration of an escalated ban (None = permanent).
    pub ban_duration_hours: Option<u32>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strike_threshold: 10,
            ban_duration_hours: Some(24),
        }
    }
}

/// What evaluation does when a collaborator store fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the failed check as passed.
    #[default]
    FailOpen,
    /// Deny the request.
    FailClosed,
}

/// Main admission configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Rate limiting settings.
    pub rate_limit: RateLimitConfig,
    /// Login lockout settings.
    pub login_guard: LoginGuardConfig,
    /// User-Agent classification settings.
    pub user_agent: UserAgentConfig,
    /// Access-log settings.
    pub access_log: AccessLogConfig,
    /// Escalation settings.
    pub escalation: EscalationConfig,
    /// Behaviour on store failure.
    pub failure_policy: FailurePolicy,
    /// Paths that skip rate limiting and login lockout.
    pub exempt_path_prefixes: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            login_guard: LoginGuardConfig::default(),
            user_agent: UserAgentConfig::default(),
            access_log: AccessLogConfig::default(),
            escalation: EscalationConfig::default(),
            failure_policy: FailurePolicy::default(),
            exempt_path_prefixes: vec!["/health".to_string()],
        }
    }
}

impl AdmissionConfig {
    /// Create a new builder for admission configuration.
    #[must_use]
    pub fn builder() -> AdmissionConfigBuilder {
        AdmissionConfigBuilder::default()
    }

    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> AdmissionResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AdmissionError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| AdmissionError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds that would make the gate meaningless.
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.rate_limit.max_requests == 0 {
            return Err(AdmissionError::Config(
                "rate_limit.max_requests must be at least 1".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(AdmissionError::Config(
                "rate_limit.window_secs must be at least 1".into(),
            ));
        }
        if self.rate_limit.window_secs > MAX_DURATION_SECS {
            return Err(AdmissionError::Config(format!(
                "rate_limit.window_secs must be at most {MAX_DURATION_SECS}"
            )));
        }
        if self.login_guard.max_attempts == 0 {
            return Err(AdmissionError::Config(
                "login_guard.max_attempts must be at least 1".into(),
            ));
        }
        if self.login_guard.lockout_secs == 0 {
            return Err(AdmissionError::Config(
                "login_guard.lockout_secs must be at least 1".into(),
            ));
        }
        if self.login_guard.lockout_secs > MAX_DURATION_SECS {
            return Err(AdmissionError::Config(format!(
                "login_guard.lockout_secs must be at most {MAX_DURATION_SECS}"
            )));
        }
        if self.access_log.user_agent_max_length == 0 {
            return Err(AdmissionError::Config(
                "access_log.user_agent_max_length must be at least 1".into(),
            ));
        }
        if self.escalation.enabled && self.escalation.strike_threshold == 0 {
            return Err(AdmissionError::Config(
                "escalation.strike_threshold must be at least 1".into(),
            ));
        }
        if self
            .escalation
            .ban_duration_hours
            .is_some_and(|h| h > MAX_BAN_HOURS)
        {
            return Err(AdmissionError::Config(format!(
                "escalation.ban_duration_hours must be at most {MAX_BAN_HOURS}"
            )));
        }
        Ok(())
    }

    /// Whether the limiter applies to `path`.
    #[must_use]
    pub fn is_rate_limited_path(&self, path: &str) -> bool {
        !self.is_exempt_path(path) && matches_any(&self.rate_limit.path_prefixes, path)
    }

    /// Whether `path` is a login endpoint.
    #[must_use]
    pub fn is_login_path(&self, path: &str) -> bool {
        !self.is_exempt_path(path) && matches_any(&self.login_guard.path_prefixes, path)
    }

    /// Whether `path` bypasses the stateful checks.
    #[must_use]
    pub fn is_exempt_path(&self, path: &str) -> bool {
        matches_any(&self.exempt_path_prefixes, path)
    }
}

/// Builder for `AdmissionConfig`.
#[derive(Debug, Clone, Default)]
pub struct AdmissionConfigBuilder {
    config: AdmissionConfig,
}

impl AdmissionConfigBuilder {
    /// Set rate limit configuration.
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Set login guard configuration.
    #[must_use]
    pub fn login_guard(mut self, config: LoginGuardConfig) -> Self {
        self.config.login_guard = config;
        self
    }

    /// Set User-Agent configuration.
    #[must_use]
    pub fn user_agent(mut self, config: UserAgentConfig) -> Self {
        self.config.user_agent = config;
        self
    }

    /// Set access-log configuration.
    #[must_use]
    pub fn access_log(mut self, config: AccessLogConfig) -> Self {
        self.config.access_log = config;
        self
    }

    /// Set escalation configuration.
    #[must_use]
    pub fn escalation(mut self, config: EscalationConfig) -> Self {
        self.config.escalation = config;
        self
    }

    /// Set the store failure policy.
    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Add an exempt path.
    #[must_use]
    pub fn exempt_path(mut self, path: impl Into<String>) -> Self {
        self.config.exempt_path_prefixes.push(path.into());
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> AdmissionConfig {
        self.config
    }
}

fn matches_any(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| path_matches(p, path))
}

/// Path matching: `*` or `/` suffix means prefix, otherwise the path must be
/// the entry itself or below it.
fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else if pattern.ends_with('/') {
        path.starts_with(pattern)
    } else {
        path == pattern
            || path
                .strip_prefix(pattern)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = AdmissionConfig::default();

        assert_eq!(config.rate_limit.max_requests, 60);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.login_guard.max_attempts, 5);
        assert_eq!(config.login_guard.lockout_secs, 300);
        assert_eq!(config.access_log.user_agent_max_length, 500);
        assert_eq!(config.failure_policy, FailurePolicy::FailOpen);
        assert!(!config.escalation.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = AdmissionConfig::builder()
            .rate_limit(RateLimitConfig {
                max_requests: 5,
                ..RateLimitConfig::default()
            })
            .failure_policy(FailurePolicy::FailClosed)
            .exempt_path("/metrics")
            .build();

        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
        assert!(config.is_exempt_path("/metrics"));
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let zero_window = AdmissionConfig::builder()
            .rate_limit(RateLimitConfig {
                window_secs: 0,
                ..RateLimitConfig::default()
            })
            .build();
        assert!(matches!(zero_window.validate(), Err(AdmissionError::Config(_))));

        let zero_attempts = AdmissionConfig::builder()
            .login_guard(LoginGuardConfig {
                max_attempts: 0,
                ..LoginGuardConfig::default()
            })
            .build();
        assert!(zero_attempts.validate().is_err());

        let zero_ua = AdmissionConfig::builder()
            .access_log(AccessLogConfig {
                user_agent_max_length: 0,
            })
            .build();
        assert!(zero_ua.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut config = AdmissionConfig::default();
        config.rate_limit.window_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(AdmissionError::Config(_))));

        let mut config = AdmissionConfig::default();
        config.login_guard.lockout_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(AdmissionError::Config(_))));

        let mut config = AdmissionConfig::default();
        config.escalation.ban_duration_hours = Some(u32::MAX);
        assert!(config.validate().is_err());

        let mut config = AdmissionConfig::default();
        config.rate_limit.window_secs = MAX_DURATION_SECS;
        config.login_guard.lockout_secs = MAX_DURATION_SECS;
        config.escalation.ban_duration_hours = Some(MAX_BAN_HOURS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_accessors_never_go_negative() {
        let mut config = AdmissionConfig::default();
        config.rate_limit.window_secs = u64::MAX;
        config.login_guard.lockout_secs = u64::MAX;

        let max = chrono::Duration::seconds(i64::try_from(MAX_DURATION_SECS).unwrap());
        assert_eq!(config.rate_limit.window(), max);
        assert_eq!(config.login_guard.lockout(), max);
    }

    #[test]
    fn test_validate_escalation_threshold_only_when_enabled() {
        let mut config = AdmissionConfig::default();
        config.escalation.strike_threshold = 0;
        assert!(config.validate().is_ok());

        config.escalation.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test_case("/api/*", "/api/search", true ; "wildcard prefix")]
    #[test_case("/api/", "/api/", true ; "slash prefix exact")]
    #[test_case("/api/", "/apis", false ; "slash prefix sibling")]
    #[test_case("/auth/login", "/auth/login", true ; "exact")]
    #[test_case("/auth/login", "/auth/login/sso", true ; "child path")]
    #[test_case("/auth/login", "/auth/loginx", false ; "no partial segment")]
    #[test_case("/auth/login", "/auth/logout", false ; "different path")]
    fn test_path_matching(pattern: &str, path: &str, expected: bool) {
        assert_eq!(path_matches(pattern, path), expected);
    }

    #[test]
    fn test_exempt_paths_skip_stateful_checks() {
        let config = AdmissionConfig::builder()
            .rate_limit(RateLimitConfig {
                path_prefixes: vec!["*".into()],
                ..RateLimitConfig::default()
            })
            .build();

        assert!(config.is_rate_limited_path("/api/search"));
        assert!(!config.is_rate_limited_path("/health"));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let json = r#"{ "rate_limit": { "max_requests": 10 }, "failure_policy": "fail_closed" }"#;
        let config: AdmissionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.login_guard.max_attempts, 5);
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.json");
        std::fs::write(&path, r#"{ "login_guard": { "lockout_secs": 60 } }"#).unwrap();

        let config = AdmissionConfig::from_json_file(&path).unwrap();
        assert_eq!(config.login_guard.lockout_secs, 60);

        std::fs::write(&path, r#"{ "rate_limit": { "window_secs": 0 } }"#).unwrap();
        assert!(AdmissionConfig::from_json_file(&path).is_err());

        assert!(AdmissionConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}

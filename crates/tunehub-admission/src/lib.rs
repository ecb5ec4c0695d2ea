//! # tunehub-admission
//!
//! Request admission gate for the TuneHub backend.
//!
//! Every incoming request gets one admit/deny decision from a fixed chain of
//! checks, and every decision leaves an access-log record.
//!
//! ## Checks (in order)
//!
//! - [`ReputationStore`] - Bans with optional expiry, persisted by the backend
//! - [`UserAgentClassifier`] - Deny-list heuristics for automated clients
//! - [`RateLimiter`] - Per-client sliding window on rate-limited paths
//! - [`LoginGuard`] - Failed-login lockout on login paths
//!
//! ## Recording
//!
//! - [`AccessLogger`] - Append-only sink for every evaluation
//! - [`AccessLogStats`] - Aggregates for admin dashboards
//!
//! ## Configuration
//!
//! - [`AdmissionConfig`] - Thresholds, path sets and failure policy
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tunehub_admission::prelude::*;
//!
//! let pipeline = AdmissionPipeline::new(
//!     AdmissionConfig::default(),
//!     Arc::new(InMemoryReputationStore::new()),
//!     Arc::new(InMemoryAccessLog::default()),
//! )
//! .unwrap();
//!
//! let request = AdmissionRequest::new("203.0.113.7", "GET", "/api/tracks")
//!     .with_user_agent("Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0");
//!
//! let (verdict, ticket) = pipeline.evaluate(&request).into_parts();
//! assert!(verdict.allow);
//!
//! // Once the handler has answered:
//! if let Some(ticket) = ticket {
//!     ticket.complete(200);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access_log;
pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod login_guard;
pub mod pipeline;
pub mod rate_limit;
pub mod reputation;

// Re-export main types
pub use access_log::{
    AccessLogEntry, AccessLogStats, AccessLogSummary, AccessLogger, InMemoryAccessLog,
    JsonLinesAccessLog, TracingAccessLogger,
};
pub use agent::{AgentReason, AgentVerdict, UserAgentClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AccessLogConfig, AdmissionConfig, EscalationConfig, FailurePolicy, LoginGuardConfig,
    MAX_BAN_HOURS, MAX_DURATION_SECS, RateLimitConfig, UserAgentConfig,
};
pub use error::{AdmissionError, AdmissionResult};
pub use key::ClientKey;
pub use login_guard::{FailureOutcome, LockStatus, LoginGuard};
pub use pipeline::{
    Admission, AdmissionPipeline, AdmissionRequest, AdmissionState, AdmissionTicket, DenyReason,
    StatsSnapshot, Verdict,
};
pub use rate_limit::{RateDecision, RateLimiter};
pub use reputation::{BanEntry, InMemoryReputationStore, JsonFileReputationStore, ReputationStore};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::access_log::{AccessLogStats, AccessLogger, InMemoryAccessLog};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::AdmissionConfig;
    pub use crate::error::{AdmissionError, AdmissionResult};
    pub use crate::key::ClientKey;
    pub use crate::pipeline::{AdmissionPipeline, AdmissionRequest, DenyReason, Verdict};
    pub use crate::reputation::{InMemoryReputationStore, ReputationStore};
}

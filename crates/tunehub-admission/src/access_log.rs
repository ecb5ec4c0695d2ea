//! Access logging backends.
//!
//! Every admission decision produces exactly one [`AccessLogEntry`]. This
//! module provides the [`AccessLogger`] sink trait, the [`AccessLogStats`]
//! read side used by the admin surface, and default implementations.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, AdmissionResult};
use crate::key::ClientKey;

const STORE_NAME: &str = "access log";

/// Status recorded when the client went away before the handler finished.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

/// Status recorded for denied requests.
pub const STATUS_FORBIDDEN: u16 = 403;

/// One immutable access-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// Client the request came from.
    pub key: ClientKey,
    /// Request path.
    pub path: String,
    /// Request method.
    pub method: String,
    /// User-Agent header, truncated.
    pub user_agent: String,
    /// Response status (403 for denials).
    pub status_code: u16,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Whether the request was denied by the gate.
    pub blocked: bool,
    /// Deny reason, for blocked requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccessLogEntry {
    /// Truncate `user_agent` to at most `max_chars` characters.
    #[must_use]
    pub fn truncate_user_agent(user_agent: &str, max_chars: usize) -> String {
        match user_agent.char_indices().nth(max_chars) {
            Some((idx, _)) => user_agent[..idx].to_string(),
            None => user_agent.to_string(),
        }
    }
}

/// Aggregate counters for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccessLogSummary {
    /// All recorded requests.
    pub total: u64,
    /// Requests denied by the gate.
    pub blocked: u64,
    /// Requests recorded on the current UTC day.
    pub today: u64,
    /// Clients with the most denied requests, highest first.
    pub top_blocked: Vec<(ClientKey, u64)>,
}

/// Trait for access-log sinks.
///
/// Implement this trait to send records to a custom destination
/// (file, database, external service).
pub trait AccessLogger: Send + Sync + std::fmt::Debug {
    /// Append a record.
    fn append(&self, entry: &AccessLogEntry) -> AdmissionResult<()>;
}

/// Read side of an access log.
pub trait AccessLogStats: Send + Sync {
    /// Aggregate counters as of `now`, with the `top_n` most blocked clients.
    fn summary(&self, now: DateTime<Utc>, top_n: usize) -> AdmissionResult<AccessLogSummary>;

    /// The most recent records, newest first.
    fn recent(&self, limit: usize) -> AdmissionResult<Vec<AccessLogEntry>>;
}

/// Access logger that emits records as `tracing` events.
///
/// Allowed requests are logged at info, blocked ones at warn.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLogger;

impl AccessLogger for TracingAccessLogger {
    fn append(&self, entry: &AccessLogEntry) -> AdmissionResult<()> {
        let reason = entry.reason.as_deref().unwrap_or("-");
        if entry.blocked {
            tracing::warn!(
                target: "tunehub_admission::access",
                key = %entry.key,
                method = %entry.method,
                path = %entry.path,
                status = entry.status_code,
                reason = %reason,
                user_agent = %entry.user_agent,
                "request blocked"
            );
        } else {
            tracing::info!(
                target: "tunehub_admission::access",
                key = %entry.key,
                method = %entry.method,
                path = %entry.path,
                status = entry.status_code,
                user_agent = %entry.user_agent,
                "request served"
            );
        }
        Ok(())
    }
}

/// Append-only JSON Lines file.
#[derive(Debug)]
pub struct JsonLinesAccessLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAccessLog {
    /// Open (creating if needed) the log file at `path` for appending.
    pub fn open(path: impl Into<PathBuf>) -> AdmissionResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AdmissionError::storage(STORE_NAME, e.to_string()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AccessLogger for JsonLinesAccessLog {
    fn append(&self, entry: &AccessLogEntry) -> AdmissionResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file
            .lock()
            .write_all(&line)
            .map_err(|e| AdmissionError::storage(STORE_NAME, e.to_string()))
    }
}

#[derive(Debug)]
struct LogCounters {
    recent: VecDeque<AccessLogEntry>,
    total: u64,
    blocked: u64,
    day: Option<NaiveDate>,
    day_count: u64,
    blocked_by_key: HashMap<ClientKey, u64>,
}

/// Bounded in-memory access log with running totals.
///
/// Keeps the last `capacity` records for inspection. Totals cover every
/// record ever appended. An optional write-through sink receives each
/// record first; a sink failure is returned to the caller but the record is
/// still counted here.
#[derive(Debug)]
pub struct InMemoryAccessLog {
    capacity: usize,
    counters: Mutex<LogCounters>,
    sink: Option<Box<dyn AccessLogger>>,
}

impl InMemoryAccessLog {
    /// Default number of records retained.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Most distinct clients tracked for the top-offender ranking. When
    /// full, a newly blocked client displaces the least blocked one.
    pub const MAX_TRACKED_OFFENDERS: usize = 1_024;

    /// Create a log that retains up to `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            counters: Mutex::new(LogCounters {
                recent: VecDeque::new(),
                total: 0,
                blocked: 0,
                day: None,
                day_count: 0,
                blocked_by_key: HashMap::new(),
            }),
            sink: None,
        }
    }

    /// Forward every record to `sink` before retaining it.
    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn AccessLogger>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.lock().recent.len()
    }

    /// Whether no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, entry: &AccessLogEntry) {
        let mut c = self.counters.lock();
        c.total += 1;

        let day = entry.timestamp.date_naive();
        if c.day == Some(day) {
            c.day_count += 1;
        } else if c.day.is_none_or(|d| d < day) {
            c.day = Some(day);
            c.day_count = 1;
        }

        if entry.blocked {
            c.blocked += 1;
            if let Some(count) = c.blocked_by_key.get_mut(&entry.key) {
                *count += 1;
            } else {
                if c.blocked_by_key.len() >= Self::MAX_TRACKED_OFFENDERS {
                    evict_least_blocked(&mut c.blocked_by_key);
                }
                c.blocked_by_key.insert(entry.key.clone(), 1);
            }
        }

        if c.recent.len() == self.capacity {
            c.recent.pop_front();
        }
        c.recent.push_back(entry.clone());
    }
}

fn evict_least_blocked(counts: &mut HashMap<ClientKey, u64>) {
    let least = counts
        .iter()
        .min_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(k, _)| k.clone());
    if let Some(key) = least {
        counts.remove(&key);
    }
}

impl Default for InMemoryAccessLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl AccessLogger for InMemoryAccessLog {
    fn append(&self, entry: &AccessLogEntry) -> AdmissionResult<()> {
        let forwarded = self.sink.as_ref().map_or(Ok(()), |s| s.append(entry));
        self.record(entry);
        forwarded
    }
}

impl AccessLogStats for InMemoryAccessLog {
    fn summary(&self, now: DateTime<Utc>, top_n: usize) -> AdmissionResult<AccessLogSummary> {
        let c = self.counters.lock();

        let mut top: Vec<(ClientKey, u64)> = c
            .blocked_by_key
            .iter()
            .map(|(k, n)| (k.clone(), *n))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(top_n);

        Ok(AccessLogSummary {
            total: c.total,
            blocked: c.blocked,
            today: if c.day == Some(now.date_naive()) {
                c.day_count
            } else {
                0
            },
            top_blocked: top,
        })
    }

    fn recent(&self, limit: usize) -> AdmissionResult<Vec<AccessLogEntry>> {
        Ok(self
            .counters
            .lock()
            .recent
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

//! IP reputation store: banned clients with optional expiry.
//!
//! Expiry is checked on read; an expired entry counts as "not banned" and
//! is deleted by the lookup that finds it. No background sweeper is needed
//! for correctness.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MAX_BAN_HOURS;
use crate::error::{AdmissionError, AdmissionResult};
use crate::key::ClientKey;

const STORE_NAME: &str = "reputation store";

/// A ban on a client key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    /// The banned client.
    pub key: ClientKey,
    /// Human-readable reason.
    pub reason: String,
    /// When the ban was created.
    pub created_at: DateTime<Utc>,
    /// When the ban expires (None = permanent).
    pub expires_at: Option<DateTime<Utc>>,
}

impl BanEntry {
    /// Create a ban starting at `now`, lasting `duration_hours` (None = permanent).
    ///
    /// Durations above [`MAX_BAN_HOURS`] are rejected with
    /// [`AdmissionError::InvalidBanDuration`].
    pub fn new(
        key: ClientKey,
        reason: impl Into<String>,
        duration_hours: Option<u32>,
        now: DateTime<Utc>,
    ) -> AdmissionResult<Self> {
        let expires_at = match duration_hours {
            None => None,
            Some(h) if h > MAX_BAN_HOURS => return Err(AdmissionError::InvalidBanDuration(h)),
            Some(h) => Some(
                now.checked_add_signed(Duration::hours(i64::from(h)))
                    .ok_or(AdmissionError::InvalidBanDuration(h))?,
            ),
        };
        Ok(Self {
            key,
            reason: reason.into(),
            created_at: now,
            expires_at,
        })
    }

    /// Whether the ban no longer applies at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Whether this ban never expires.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// Storage for bans.
///
/// Every call must be atomic from the caller's point of view. Implementations
/// backed by remote storage report outages as
/// [`AdmissionError::StorageUnavailable`].
pub trait ReputationStore: Send + Sync + std::fmt::Debug {
    /// Whether `key` has a live ban at `now`.
    fn is_banned(&self, key: &ClientKey, now: DateTime<Utc>) -> AdmissionResult<bool>;

    /// Insert or overwrite the ban for `entry.key`.
    fn ban(&self, entry: BanEntry) -> AdmissionResult<()>;

    /// Remove any ban for `key`. Returns whether one existed.
    fn unban(&self, key: &ClientKey) -> AdmissionResult<bool>;

    /// Live bans, newest first.
    fn list(&self, now: DateTime<Utc>) -> AdmissionResult<Vec<BanEntry>>;
}

fn log_banned(entry: &BanEntry, replaced: bool) {
    if replaced {
        info!(key = %entry.key, reason = %entry.reason, "Client re-banned");
    } else {
        info!(key = %entry.key, reason = %entry.reason, "Client banned");
    }
}

/// Ban table shared by the in-memory and file-backed stores.
#[derive(Debug, Default)]
struct BanTable {
    entries: HashMap<ClientKey, BanEntry>,
}

impl BanTable {
    /// Look up `key`, deleting an expired entry. Returns (banned, table changed).
    fn check(&mut self, key: &ClientKey, now: DateTime<Utc>) -> (bool, bool) {
        match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                debug!(key = %key, "Ban expired, removing");
                self.entries.remove(key);
                (false, true)
            }
            Some(_) => (true, false),
            None => (false, false),
        }
    }

    /// Insert `entry`, returning the entry it replaced.
    fn insert(&mut self, entry: BanEntry) -> Option<BanEntry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    fn remove(&mut self, key: &ClientKey) -> Option<BanEntry> {
        self.entries.remove(key)
    }

    /// Put `key` back to `previous`, undoing an insert or remove.
    fn restore(&mut self, key: &ClientKey, previous: Option<BanEntry>) {
        match previous {
            Some(entry) => {
                self.entries.insert(key.clone(), entry);
            }
            None => {
                self.entries.remove(key);
            }
        }
    }

    fn live(&self, now: DateTime<Utc>) -> Vec<BanEntry> {
        let mut live: Vec<BanEntry> = self
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect();
        live.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.key.cmp(&b.key)));
        live
    }
}

/// Process-local reputation store.
#[derive(Debug, Default)]
pub struct InMemoryReputationStore {
    table: RwLock<BanTable>,
}

impl InMemoryReputationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().entries.len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReputationStore for InMemoryReputationStore {
    fn is_banned(&self, key: &ClientKey, now: DateTime<Utc>) -> AdmissionResult<bool> {
        // Fast path under the read lock; only expired hits need the write lock.
        match self.table.read().entries.get(key) {
            None => return Ok(false),
            Some(entry) if !entry.is_expired(now) => return Ok(true),
            Some(_) => {}
        }
        Ok(self.table.write().check(key, now).0)
    }

    fn ban(&self, entry: BanEntry) -> AdmissionResult<()> {
        let replaced = self.table.write().insert(entry.clone()).is_some();
        log_banned(&entry, replaced);
        Ok(())
    }

    fn unban(&self, key: &ClientKey) -> AdmissionResult<bool> {
        let removed = self.table.write().remove(key).is_some();
        if removed {
            info!(key = %key, "Client unbanned");
        }
        Ok(removed)
    }

    fn list(&self, now: DateTime<Utc>) -> AdmissionResult<Vec<BanEntry>> {
        Ok(self.table.read().live(now))
    }
}

/// Reputation store persisted as a JSON snapshot after every mutation.
#[derive(Debug)]
pub struct JsonFileReputationStore {
    path: PathBuf,
    table: RwLock<BanTable>,
}

impl JsonFileReputationStore {
    /// Open the store at `path`, loading existing bans if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> AdmissionResult<Self> {
        let path = path.into();
        let mut table = BanTable::default();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| AdmissionError::storage(STORE_NAME, e.to_string()))?;
            if !raw.trim().is_empty() {
                let entries: Vec<BanEntry> = serde_json::from_str(&raw)?;
                table.entries = entries.into_iter().map(|e| (e.key.clone(), e)).collect();
            }
        }
        debug!(path = %path.display(), count = table.entries.len(), "Loaded bans from disk");

        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    /// Location of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self, table: &BanTable) -> AdmissionResult<()> {
        let mut entries: Vec<&BanEntry> = table.entries.values().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let json = serde_json::to_vec_pretty(&entries)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| {
                warn!(path = %self.path.display(), error = %e, "Failed to snapshot bans");
                AdmissionError::storage(STORE_NAME, e.to_string())
            })
    }
}

impl ReputationStore for JsonFileReputationStore {
    fn is_banned(&self, key: &ClientKey, now: DateTime<Utc>) -> AdmissionResult<bool> {
        match self.table.read().entries.get(key) {
            None => return Ok(false),
            Some(entry) if !entry.is_expired(now) => return Ok(true),
            Some(_) => {}
        }
        let mut table = self.table.write();
        let (banned, changed) = table.check(key, now);
        if changed {
            // Lazy deletion is best effort; the verdict stands either way.
            let _ = self.snapshot(&table);
        }
        Ok(banned)
    }

    /// The table is only changed if the snapshot succeeds.
    fn ban(&self, entry: BanEntry) -> AdmissionResult<()> {
        let mut table = self.table.write();
        let key = entry.key.clone();
        let previous = table.insert(entry.clone());
        let replaced = previous.is_some();
        if let Err(e) = self.snapshot(&table) {
            table.restore(&key, previous);
            return Err(e);
        }
        log_banned(&entry, replaced);
        Ok(())
    }

    fn unban(&self, key: &ClientKey) -> AdmissionResult<bool> {
        let mut table = self.table.write();
        let Some(previous) = table.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.snapshot(&table) {
            table.restore(key, Some(previous));
            return Err(e);
        }
        info!(key = %key, "Client unbanned");
        Ok(true)
    }

    fn list(&self, now: DateTime<Utc>) -> AdmissionResult<Vec<BanEntry>> {
        Ok(self.table.read().live(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ClientKey {
        ClientKey::new(s)
    }

    fn entry(k: &str, reason: &str, hours: Option<u32>, now: DateTime<Utc>) -> BanEntry {
        BanEntry::new(key(k), reason, hours, now).unwrap()
    }

    // ==================== BanEntry Tests ====================

    #[test]
    fn test_ban_entry_temporary() {
        let now = Utc::now();
        let entry = BanEntry::new(key("1.2.3.4"), "abuse", Some(24), now).unwrap();

        assert_eq!(entry.expires_at, Some(now + Duration::hours(24)));
        assert!(!entry.is_permanent());
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::hours(24)));
    }

    #[test]
    fn test_ban_entry_permanent() {
        let now = Utc::now();
        let entry = BanEntry::new(key("1.2.3.4"), "abuse", None, now).unwrap();

        assert!(entry.is_permanent());
        assert!(!entry.is_expired(now + Duration::days(3650)));
    }

    #[test]
    fn test_ban_entry_rejects_out_of_range_duration() {
        let now = Utc::now();
        let result = BanEntry::new(key("1.2.3.4"), "abuse", Some(u32::MAX), now);
        assert!(matches!(result, Err(AdmissionError::InvalidBanDuration(u32::MAX))));

        let longest = BanEntry::new(key("1.2.3.4"), "abuse", Some(MAX_BAN_HOURS), now).unwrap();
        assert!(!longest.is_expired(now));
    }

    // ==================== InMemoryReputationStore Tests ====================

    #[test]
    fn test_ban_and_check() {
        let store = InMemoryReputationStore::new();
        let now = Utc::now();

        assert!(!store.is_banned(&key("1.2.3.4"), now).unwrap());
        store
            .ban(entry("1.2.3.4", "abuse", Some(24), now))
            .unwrap();
        assert!(store.is_banned(&key("1.2.3.4"), now).unwrap());
        assert!(!store.is_banned(&key("5.6.7.8"), now).unwrap());
    }

    #[test]
    fn test_ban_overwrites_existing_entry() {
        let store = InMemoryReputationStore::new();
        let now = Utc::now();

        store
            .ban(entry("1.2.3.4", "first", Some(1), now))
            .unwrap();
        store
            .ban(entry("1.2.3.4", "second", Some(48), now))
            .unwrap();

        let bans = store.list(now).unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].reason, "second");
        assert_eq!(bans[0].expires_at, Some(now + Duration::hours(48)));
    }

    #[test]
    fn test_unban() {
        let store = InMemoryReputationStore::new();
        let now = Utc::now();

        store
            .ban(entry("1.2.3.4", "abuse", None, now))
            .unwrap();
        assert!(store.unban(&key("1.2.3.4")).unwrap());
        assert!(!store.is_banned(&key("1.2.3.4"), now).unwrap());
        assert!(!store.unban(&key("1.2.3.4")).unwrap());
    }

    #[test]
    fn test_expired_entry_is_lazily_deleted() {
        let store = InMemoryReputationStore::new();
        let now = Utc::now();

        store
            .ban(entry("1.2.3.4", "abuse", Some(1), now))
            .unwrap();
        assert_eq!(store.len(), 1);

        let later = now + Duration::hours(2);
        assert!(store.list(later).unwrap().is_empty());
        assert_eq!(store.len(), 1);

        assert!(!store.is_banned(&key("1.2.3.4"), later).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_list_is_newest_first() {
        let store = InMemoryReputationStore::new();
        let now = Utc::now();

        store
            .ban(entry("a", "old", None, now))
            .unwrap();
        store
            .ban(entry("b", "new", None, now + Duration::minutes(5)))
            .unwrap();

        let bans = store.list(now + Duration::minutes(10)).unwrap();
        let keys: Vec<_> = bans.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    // ==================== JsonFileReputationStore Tests ====================

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans.json");
        let now = Utc::now();

        {
            let store = JsonFileReputationStore::open(&path).unwrap();
            store
                .ban(entry("1.2.3.4", "abuse", Some(24), now))
                .unwrap();
            store
                .ban(entry("5.6.7.8", "spam", None, now))
                .unwrap();
            store.unban(&key("5.6.7.8")).unwrap();
        }

        let reopened = JsonFileReputationStore::open(&path).unwrap();
        assert!(reopened.is_banned(&key("1.2.3.4"), now).unwrap());
        assert!(!reopened.is_banned(&key("5.6.7.8"), now).unwrap());
        assert_eq!(reopened.list(now).unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileReputationStore::open(dir.path().join("none.json")).unwrap();
        assert!(store.list(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_failed_snapshot_leaves_bans_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("bans.json");
        let now = Utc::now();

        let store = JsonFileReputationStore::open(&path).unwrap();
        let result = store.ban(entry("1.2.3.4", "abuse", None, now));
        assert!(matches!(result, Err(AdmissionError::StorageUnavailable { .. })));
        assert!(!store.is_banned(&key("1.2.3.4"), now).unwrap());
        assert!(store.list(now).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_failed_unban_keeps_ban() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("state");
        std::fs::create_dir(&sub).unwrap();
        let path = sub.join("bans.json");
        let now = Utc::now();

        let store = JsonFileReputationStore::open(&path).unwrap();
        store.ban(entry("1.2.3.4", "abuse", None, now)).unwrap();
        std::fs::remove_dir_all(&sub).unwrap();

        assert!(store.unban(&key("1.2.3.4")).is_err());
        assert!(store.is_banned(&key("1.2.3.4"), now).unwrap());
    }

    #[test]
    fn test_file_store_drops_expired_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans.json");
        let now = Utc::now();

        let store = JsonFileReputationStore::open(&path).unwrap();
        store
            .ban(entry("1.2.3.4", "abuse", Some(1), now))
            .unwrap();
        assert!(!store.is_banned(&key("1.2.3.4"), now + Duration::hours(1)).unwrap());

        let raw = std::fs::read_to_string(&path).unwrap();
        let persisted: Vec<BanEntry> = serde_json::from_str(&raw).unwrap();
        assert!(persisted.is_empty());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans.json");
        std::fs::write(&path, "not json").unwrap();

        let result = JsonFileReputationStore::open(&path);
        assert!(matches!(result, Err(AdmissionError::Serialization(_))));
    }
}

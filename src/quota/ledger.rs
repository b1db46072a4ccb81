use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{MILLIS_PER_MINUTE, day_key};
use crate::platform::{atomic_write, ensure_directory_exists, read_optional};

/// Current ledger layout version
const LEDGER_VERSION: &str = "1.0";

/// Usage and limit for one monitored package on the current day
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageRecord {
    pub package_id: String,
    pub day_key: String,
    pub used_millis_today: i64,
    pub limit_minutes: Option<u32>,
}

impl UsageRecord {
    /// Minutes left today, or `None` when the package has no limit
    ///
    /// Partial minutes count as used (integer floor), so a package is never
    /// revoked before its full allowance has been consumed.
    pub fn remaining_minutes(&self) -> Option<i64> {
        self.limit_minutes.map(|limit| {
            let consumed = self.used_millis_today.max(0) / MILLIS_PER_MINUTE;
            (i64::from(limit) - consumed).max(0)
        })
    }

    /// Limit expressed in milliseconds
    pub fn limit_millis(&self) -> Option<i64> {
        self.limit_minutes.map(limit_to_millis)
    }

    /// Whether a set limit has been fully consumed
    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining_minutes(), Some(remaining) if remaining <= 0)
    }
}

/// Convert a limit in minutes to milliseconds
pub fn limit_to_millis(limit_minutes: u32) -> i64 {
    i64::from(limit_minutes) * MILLIS_PER_MINUTE
}

/// Per-package usage records keyed by package id
pub type UsageSnapshot = HashMap<String, UsageRecord>;

/// Persisted per-package usage/limit store with day-rollover semantics
///
/// Each call is atomic on its own (read-modify-write under the store's lock);
/// there is no transaction spanning several calls or several packages.
pub trait UsageLedger: Send + Sync {
    /// All known records, stamped with the stored day marker
    fn snapshot(&self) -> Result<UsageSnapshot>;

    /// Add per-package deltas; results are floored at zero
    fn apply_delta(&self, deltas: &HashMap<String, i64>) -> Result<()>;

    /// Zero every record when the stored day differs from `day_key(now_millis)`
    ///
    /// Returns `true` when a reset happened.
    fn reset_if_new_day(&self, now_millis: i64) -> Result<bool>;

    /// Set (`Some`) or clear (`None`) per-package limits
    fn set_limits(&self, limits: &HashMap<String, Option<u32>>) -> Result<()>;

    /// Stored day marker, if any
    fn day_marker(&self) -> Result<Option<String>>;

    /// End of the last event-replay window
    fn last_reconciled_at(&self) -> Result<Option<i64>>;

    fn set_last_reconciled_at(&self, millis: i64) -> Result<()>;
}

/// Persisted shape of one package entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
struct PackageEntry {
    package_id: String,
    #[serde(default)]
    used_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit_minutes: Option<u32>,
}

impl PackageEntry {
    fn new(package_id: &str) -> Self {
        Self {
            package_id: package_id.to_string(),
            ..Default::default()
        }
    }

    fn add(&mut self, delta: i64) {
        self.used_millis = self.used_millis.saturating_add(delta).max(0);
    }

    fn to_record(&self, day: &str) -> UsageRecord {
        UsageRecord {
            package_id: self.package_id.clone(),
            day_key: day.to_string(),
            used_millis_today: self.used_millis.max(0),
            limit_minutes: self.limit_minutes,
        }
    }
}

/// Ledger-wide metadata
#[derive(Debug, Clone, Deserialize, Serialize)]
struct LedgerMeta {
    version: String,
    #[serde(default)]
    day: Option<String>,
    #[serde(default)]
    last_reconciled_at: Option<i64>,
    /// Stored metadata was unreadable, so the records' day is unknown
    #[serde(skip)]
    discarded: bool,
}

impl Default for LedgerMeta {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION.to_string(),
            day: None,
            last_reconciled_at: None,
            discarded: false,
        }
    }
}

impl LedgerMeta {
    fn unreadable() -> Self {
        Self {
            discarded: true,
            ..Self::default()
        }
    }
}

/// Decide whether a stored marker must be rolled over
///
/// A missing marker is adopted as today without zeroing anything.
fn rollover(meta: &LedgerMeta, now_millis: i64) -> Option<String> {
    let today = day_key(now_millis);
    match &meta.day {
        Some(stored) if *stored == today => None,
        _ => Some(today),
    }
}

/// In-memory ledger, for embedding hosts without durable storage and for tests
#[derive(Debug, Default)]
pub struct MemoryUsageLedger {
    inner: Mutex<MemoryLedgerState>,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    meta: LedgerMeta,
    packages: BTreeMap<String, PackageEntry>,
}

impl MemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger whose day marker is already set to `day`
    pub fn with_day(day: &str) -> Self {
        let ledger = Self::default();
        if let Ok(mut state) = ledger.inner.lock() {
            state.meta.day = Some(day.to_string());
        }
        ledger
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryLedgerState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("usage ledger lock poisoned"))
    }
}

impl UsageLedger for MemoryUsageLedger {
    fn snapshot(&self) -> Result<UsageSnapshot> {
        let state = self.lock()?;
        let day = state.meta.day.clone().unwrap_or_default();
        Ok(state
            .packages
            .values()
            .map(|entry| (entry.package_id.clone(), entry.to_record(&day)))
            .collect())
    }

    fn apply_delta(&self, deltas: &HashMap<String, i64>) -> Result<()> {
        let mut state = self.lock()?;
        for (package_id, delta) in deltas {
            state
                .packages
                .entry(package_id.clone())
                .or_insert_with(|| PackageEntry::new(package_id))
                .add(*delta);
        }
        Ok(())
    }

    fn reset_if_new_day(&self, now_millis: i64) -> Result<bool> {
        let mut state = self.lock()?;
        let had_marker = state.meta.day.is_some();
        let Some(today) = rollover(&state.meta, now_millis) else {
            return Ok(false);
        };

        if had_marker {
            for entry in state.packages.values_mut() {
                entry.used_millis = 0;
            }
        }
        state.meta.day = Some(today);
        Ok(had_marker)
    }

    fn set_limits(&self, limits: &HashMap<String, Option<u32>>) -> Result<()> {
        let mut state = self.lock()?;
        for (package_id, limit) in limits {
            state
                .packages
                .entry(package_id.clone())
                .or_insert_with(|| PackageEntry::new(package_id))
                .limit_minutes = *limit;
        }
        Ok(())
    }

    fn day_marker(&self) -> Result<Option<String>> {
        Ok(self.lock()?.meta.day.clone())
    }

    fn last_reconciled_at(&self) -> Result<Option<i64>> {
        Ok(self.lock()?.meta.last_reconciled_at)
    }

    fn set_last_reconciled_at(&self, millis: i64) -> Result<()> {
        self.lock()?.meta.last_reconciled_at = Some(millis);
        Ok(())
    }
}

/// File-backed ledger: one JSON record per package plus a metadata file
///
/// ```text
/// <root>/
/// ├── meta.json
/// └── packages/
///     ├── com.example.game.json
///     └── ...
/// ```
///
/// Every record is upserted on its own with an atomic temp-file rename, so a
/// delta for one package never rewrites the others.
#[derive(Debug)]
pub struct FileUsageLedger {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileUsageLedger {
    /// Open (or lazily create) a ledger rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("usage ledger lock poisoned"))
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    fn package_path(&self, package_id: &str) -> PathBuf {
        self.packages_dir()
            .join(format!("{}.json", escape_file_name(package_id)))
    }

    fn read_meta(&self) -> Result<LedgerMeta> {
        let path = self.meta_path();
        let Some(content) = read_optional(&path)? else {
            return Ok(LedgerMeta::default());
        };

        match serde_json::from_str::<LedgerMeta>(&content) {
            Ok(meta) if meta.version == LEDGER_VERSION => Ok(meta),
            Ok(meta) => {
                warn!(
                    "Ledger metadata version mismatch (expected {}, got {}). Starting fresh.",
                    LEDGER_VERSION, meta.version
                );
                Ok(LedgerMeta::unreadable())
            }
            Err(e) => {
                warn!("Ignoring malformed ledger metadata {}: {}", path.display(), e);
                Ok(LedgerMeta::unreadable())
            }
        }
    }

    fn write_meta(&self, meta: &LedgerMeta) -> Result<()> {
        let content = serde_json::to_string_pretty(meta).context("Failed to serialize ledger metadata")?;
        atomic_write(&self.meta_path(), content.as_bytes())
            .with_context(|| format!("Failed to write ledger metadata: {}", self.meta_path().display()))
    }

    fn read_entry_at(path: &Path) -> Result<Option<PackageEntry>> {
        let Some(content) = read_optional(path)? else {
            return Ok(None);
        };

        match serde_json::from_str::<PackageEntry>(&content) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Ignoring malformed usage record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn read_entry(&self, package_id: &str) -> Result<PackageEntry> {
        Ok(Self::read_entry_at(&self.package_path(package_id))?
            .filter(|entry| entry.package_id == package_id)
            .unwrap_or_else(|| PackageEntry::new(package_id)))
    }

    fn write_entry(&self, entry: &PackageEntry) -> Result<()> {
        let path = self.package_path(&entry.package_id);
        let content = serde_json::to_string_pretty(entry).context("Failed to serialize usage record")?;
        atomic_write(&path, content.as_bytes())
            .with_context(|| format!("Failed to write usage record: {}", path.display()))
    }

    fn read_all_entries(&self) -> Result<Vec<PackageEntry>> {
        let dir = self.packages_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for item in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list usage records: {}", dir.display()))?
        {
            let path = item.context("Failed to read ledger directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = Self::read_entry_at(&path)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

impl UsageLedger for FileUsageLedger {
    fn snapshot(&self) -> Result<UsageSnapshot> {
        let _guard = self.guard()?;
        let day = self.read_meta()?.day.unwrap_or_default();
        Ok(self
            .read_all_entries()?
            .into_iter()
            .map(|entry| (entry.package_id.clone(), entry.to_record(&day)))
            .collect())
    }

    fn apply_delta(&self, deltas: &HashMap<String, i64>) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let _guard = self.guard()?;
        ensure_directory_exists(&self.packages_dir())?;

        for (package_id, delta) in deltas {
            let mut entry = self.read_entry(package_id)?;
            entry.add(*delta);
            self.write_entry(&entry)?;
            debug!("Ledger {} += {}ms (now {}ms)", package_id, delta, entry.used_millis);
        }
        Ok(())
    }

    fn reset_if_new_day(&self, now_millis: i64) -> Result<bool> {
        let _guard = self.guard()?;
        let mut meta = self.read_meta()?;
        // Records under unreadable metadata belong to an unknown day
        let had_marker = meta.day.is_some() || meta.discarded;
        let Some(today) = rollover(&meta, now_millis) else {
            return Ok(false);
        };

        // Records are zeroed before the marker moves, so an interrupted reset
        // is simply redone by the next call.
        if had_marker {
            for mut entry in self.read_all_entries()? {
                if entry.used_millis != 0 {
                    entry.used_millis = 0;
                    self.write_entry(&entry)?;
                }
            }
            info!(
                "Daily usage reset ({} -> {})",
                meta.day.as_deref().unwrap_or("-"),
                today
            );
        }

        meta.day = Some(today);
        self.write_meta(&meta)?;
        Ok(had_marker)
    }

    fn set_limits(&self, limits: &HashMap<String, Option<u32>>) -> Result<()> {
        let _guard = self.guard()?;
        ensure_directory_exists(&self.packages_dir())?;

        for (package_id, limit) in limits {
            let mut entry = self.read_entry(package_id)?;
            entry.limit_minutes = *limit;
            self.write_entry(&entry)?;
        }
        Ok(())
    }

    fn day_marker(&self) -> Result<Option<String>> {
        let _guard = self.guard()?;
        Ok(self.read_meta()?.day)
    }

    fn last_reconciled_at(&self) -> Result<Option<i64>> {
        let _guard = self.guard()?;
        Ok(self.read_meta()?.last_reconciled_at)
    }

    fn set_last_reconciled_at(&self, millis: i64) -> Result<()> {
        let _guard = self.guard()?;
        let mut meta = self.read_meta()?;
        meta.last_reconciled_at = Some(millis);
        self.write_meta(&meta)
    }
}

/// Map a package id onto a safe file name
fn escape_file_name(package_id: &str) -> String {
    let mut escaped = String::with_capacity(package_id.len());
    for (i, c) in package_id.chars().enumerate() {
        let safe = c.is_ascii_alphanumeric() || c == '-' || c == '_' || (c == '.' && i > 0);
        if safe {
            escaped.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                escaped.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::start_of_day;
    use chrono::Utc;
    use tempfile::tempdir;

    const DAY_MILLIS: i64 = 24 * 3600 * 1000;

    fn deltas(items: &[(&str, i64)]) -> HashMap<String, i64> {
        items.iter().map(|(p, d)| (p.to_string(), *d)).collect()
    }

    fn limits(items: &[(&str, Option<u32>)]) -> HashMap<String, Option<u32>> {
        items.iter().map(|(p, l)| (p.to_string(), *l)).collect()
    }

    fn record(used: i64, limit: Option<u32>) -> UsageRecord {
        UsageRecord {
            package_id: "pkg".to_string(),
            day_key: "2025-11-16".to_string(),
            used_millis_today: used,
            limit_minutes: limit,
        }
    }

    #[test]
    fn test_remaining_minutes_unlimited() {
        assert_eq!(record(999_999, None).remaining_minutes(), None);
        assert!(!record(999_999, None).is_exhausted());
    }

    #[test]
    fn test_remaining_minutes_floors_partial_minute() {
        // 9m59s used of 10 minutes: 9 whole minutes consumed, 1 left
        assert_eq!(record(599_999, Some(10)).remaining_minutes(), Some(1));
        // 30s used: still counts as 0 whole minutes consumed
        assert_eq!(record(30_000, Some(10)).remaining_minutes(), Some(10));
        assert_eq!(record(600_000, Some(10)).remaining_minutes(), Some(0));
    }

    #[test]
    fn test_remaining_minutes_never_negative() {
        assert_eq!(record(3_600_000, Some(10)).remaining_minutes(), Some(0));
        assert!(record(3_600_000, Some(10)).is_exhausted());
        assert!(record(0, Some(0)).is_exhausted());
    }

    #[test]
    fn test_memory_apply_delta_is_additive_and_floored() {
        let ledger = MemoryUsageLedger::new();
        ledger.apply_delta(&deltas(&[("a", 1_000), ("b", 500)])).unwrap();
        ledger.apply_delta(&deltas(&[("a", 2_000)])).unwrap();
        ledger.apply_delta(&deltas(&[("b", -10_000)])).unwrap();

        let snap = ledger.snapshot().unwrap();
        assert_eq!(snap["a"].used_millis_today, 3_000);
        assert_eq!(snap["b"].used_millis_today, 0);
    }

    #[test]
    fn test_memory_reset_if_new_day() {
        let now = Utc::now().timestamp_millis();
        let ledger = MemoryUsageLedger::new();

        // First observation adopts the marker without zeroing
        ledger.apply_delta(&deltas(&[("a", 1_000)])).unwrap();
        assert!(!ledger.reset_if_new_day(now).unwrap());
        assert_eq!(ledger.snapshot().unwrap()["a"].used_millis_today, 1_000);

        // Same day: no-op
        assert!(!ledger.reset_if_new_day(now).unwrap());

        // Next day: zeroed, limits preserved
        ledger.set_limits(&limits(&[("a", Some(30))])).unwrap();
        let tomorrow = start_of_day(now) + DAY_MILLIS + 3_600_000;
        assert!(ledger.reset_if_new_day(tomorrow).unwrap());
        let snap = ledger.snapshot().unwrap();
        assert_eq!(snap["a"].used_millis_today, 0);
        assert_eq!(snap["a"].limit_minutes, Some(30));
        assert_eq!(snap["a"].day_key, day_key(tomorrow));
    }

    #[test]
    fn test_memory_set_limits_sets_and_clears() {
        let ledger = MemoryUsageLedger::new();
        ledger.set_limits(&limits(&[("a", Some(15)), ("b", Some(5))])).unwrap();
        ledger.set_limits(&limits(&[("b", None)])).unwrap();

        let snap = ledger.snapshot().unwrap();
        assert_eq!(snap["a"].limit_minutes, Some(15));
        assert_eq!(snap["b"].limit_minutes, None);
    }

    #[test]
    fn test_file_ledger_persists_across_instances() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp_millis();

        {
            let ledger = FileUsageLedger::new(dir.path().join("ledger"));
            ledger.reset_if_new_day(now).unwrap();
            ledger.apply_delta(&deltas(&[("com.example.game", 42_000)])).unwrap();
            ledger.set_limits(&limits(&[("com.example.game", Some(10))])).unwrap();
            ledger.set_last_reconciled_at(now).unwrap();
        }

        let ledger = FileUsageLedger::new(dir.path().join("ledger"));
        let snap = ledger.snapshot().unwrap();
        let game = &snap["com.example.game"];
        assert_eq!(game.used_millis_today, 42_000);
        assert_eq!(game.limit_minutes, Some(10));
        assert_eq!(game.day_key, day_key(now));
        assert_eq!(ledger.last_reconciled_at().unwrap(), Some(now));
        assert!(dir.path().join("ledger/packages/com.example.game.json").exists());
    }

    #[test]
    fn test_file_ledger_reset_zeroes_every_record() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp_millis();
        let ledger = FileUsageLedger::new(dir.path());

        ledger.reset_if_new_day(now).unwrap();
        ledger.apply_delta(&deltas(&[("a", 1_000), ("b", 2_000)])).unwrap();

        let tomorrow = start_of_day(now) + DAY_MILLIS + 3_600_000;
        assert!(ledger.reset_if_new_day(tomorrow).unwrap());
        let snap = ledger.snapshot().unwrap();
        assert!(snap.values().all(|r| r.used_millis_today == 0));
        assert_eq!(ledger.day_marker().unwrap(), Some(day_key(tomorrow)));
    }

    #[test]
    fn test_file_ledger_missing_directory_reads_empty() {
        let dir = tempdir().unwrap();
        let ledger = FileUsageLedger::new(dir.path().join("never-created"));
        assert!(ledger.snapshot().unwrap().is_empty());
        assert_eq!(ledger.day_marker().unwrap(), None);
        assert_eq!(ledger.last_reconciled_at().unwrap(), None);
    }

    #[test]
    fn test_file_ledger_malformed_record_reads_as_default() {
        let dir = tempdir().unwrap();
        let ledger = FileUsageLedger::new(dir.path());
        std::fs::create_dir_all(dir.path().join("packages")).unwrap();
        std::fs::write(dir.path().join("packages/a.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("meta.json"), "garbage").unwrap();

        assert!(ledger.snapshot().unwrap().is_empty());
        ledger.apply_delta(&deltas(&[("a", 7)])).unwrap();
        assert_eq!(ledger.snapshot().unwrap()["a"].used_millis_today, 7);
    }

    #[test]
    fn test_file_ledger_unreadable_meta_zeroes_records_on_reset() {
        let now = Utc::now().timestamp_millis();

        for meta in [r#"{"version": "0.9", "day": "2000-01-01"}"#, "garbage"] {
            let dir = tempdir().unwrap();
            let ledger = FileUsageLedger::new(dir.path());
            ledger.set_limits(&limits(&[("game", Some(10))])).unwrap();
            ledger.apply_delta(&deltas(&[("game", 500_000)])).unwrap();
            std::fs::write(dir.path().join("meta.json"), meta).unwrap();

            assert!(ledger.reset_if_new_day(now).unwrap());

            let record = &ledger.snapshot().unwrap()["game"];
            assert_eq!(record.used_millis_today, 0);
            assert_eq!(record.limit_minutes, Some(10));
            assert_eq!(ledger.day_marker().unwrap(), Some(day_key(now)));
        }
    }

    #[test]
    fn test_escape_file_name() {
        assert_eq!(escape_file_name("com.example.app"), "com.example.app");
        assert_eq!(escape_file_name("../etc/passwd"), "%2E.%2Fetc%2Fpasswd");
        assert_eq!(escape_file_name("a b"), "a%20b");
    }
}

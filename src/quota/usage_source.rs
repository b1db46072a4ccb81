use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::day_key;

/// Kind of a raw usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageEventKind {
    /// Application moved to (or resumed in) the foreground
    Foreground,
    /// Application paused or moved to the background
    Background,
}

/// Raw foreground/background transition reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageEvent {
    pub package_id: String,
    pub kind: UsageEventKind,
    pub timestamp: i64,
}

/// OS usage-statistics capability
pub trait UsageStatsProvider: Send + Sync {
    /// Whether the process may query usage statistics at all
    fn has_usage_permission(&self) -> bool;

    /// Total foreground millis per package within `[start, end)`
    fn query_aggregated(&self, start_millis: i64, end_millis: i64) -> Result<HashMap<String, i64>>;

    /// Raw events within `[start, end)`, oldest first
    fn query_events(&self, _start_millis: i64, _end_millis: i64) -> Result<Vec<UsageEvent>> {
        Ok(Vec::new())
    }
}

/// Usage report produced by an external collector
///
/// ```json
/// {
///   "day": "2025-11-16",
///   "totals": { "com.example.game": 540000 },
///   "events": [ { "package_id": "com.example.game", "kind": "foreground", "timestamp": 1763290000000 } ]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UsageReport {
    /// Calendar day the totals belong to; totals from another day, or from an
    /// undated report, are ignored
    #[serde(default)]
    pub day: Option<String>,
    #[serde(default)]
    pub totals: HashMap<String, i64>,
    #[serde(default)]
    pub events: Vec<UsageEvent>,
}

/// Usage source backed by a JSON report file
///
/// Permission is granted when the report exists and is readable.
#[derive(Debug, Clone)]
pub struct JsonReportSource {
    path: PathBuf,
}

impl JsonReportSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<UsageReport> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read usage report: {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse usage report: {}", self.path.display()))
    }
}

impl UsageStatsProvider for JsonReportSource {
    fn has_usage_permission(&self) -> bool {
        std::fs::File::open(&self.path).is_ok()
    }

    /// Totals only count for the day they are stamped with; an undated
    /// report carries no totals for any window.
    fn query_aggregated(&self, start_millis: i64, _end_millis: i64) -> Result<HashMap<String, i64>> {
        let report = self.load()?;
        let window_day = day_key(start_millis);
        match report.day.as_deref() {
            Some(day) if day == window_day => Ok(report.totals),
            Some(day) => {
                debug!("Usage report is for {}, ignoring totals for {}", day, window_day);
                Ok(HashMap::new())
            }
            None => {
                warn!("Usage report has no day, ignoring its totals");
                Ok(HashMap::new())
            }
        }
    }

    fn query_events(&self, start_millis: i64, end_millis: i64) -> Result<Vec<UsageEvent>> {
        let mut events: Vec<UsageEvent> = self
            .load()?
            .events
            .into_iter()
            .filter(|e| e.timestamp >= start_millis && e.timestamp < end_millis)
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

/// Usage source whose data is pushed in by the host
#[derive(Debug, Default)]
pub struct StaticUsageSource {
    inner: Mutex<StaticUsage>,
}

#[derive(Debug)]
struct StaticUsage {
    permitted: bool,
    totals: HashMap<String, i64>,
    events: Vec<UsageEvent>,
}

impl Default for StaticUsage {
    fn default() -> Self {
        Self {
            permitted: true,
            totals: HashMap::new(),
            events: Vec::new(),
        }
    }
}

impl StaticUsageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_permitted(&self, permitted: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.permitted = permitted;
        }
    }

    pub fn set_total(&self, package_id: &str, millis: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.totals.insert(package_id.to_string(), millis);
        }
    }

    pub fn push_event(&self, package_id: &str, kind: UsageEventKind, timestamp: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.events.push(UsageEvent {
                package_id: package_id.to_string(),
                kind,
                timestamp,
            });
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StaticUsage>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("usage source lock poisoned"))
    }
}

impl UsageStatsProvider for StaticUsageSource {
    fn has_usage_permission(&self) -> bool {
        self.lock().map(|inner| inner.permitted).unwrap_or(false)
    }

    fn query_aggregated(&self, _start_millis: i64, _end_millis: i64) -> Result<HashMap<String, i64>> {
        Ok(self.lock()?.totals.clone())
    }

    fn query_events(&self, start_millis: i64, end_millis: i64) -> Result<Vec<UsageEvent>> {
        let mut events: Vec<UsageEvent> = self
            .lock()?
            .events
            .iter()
            .filter(|e| e.timestamp >= start_millis && e.timestamp < end_millis)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

use chrono::{DateTime, Local, LocalResult, NaiveTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Milliseconds in one minute of quota
pub const MILLIS_PER_MINUTE: i64 = 60_000;

/// Wall-clock source in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock, for embedding hosts that replay recorded time and for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn local_time(millis: i64) -> DateTime<Local> {
    match Local.timestamp_millis_opt(millis) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => Utc::now().with_timezone(&Local),
    }
}

/// Calendar day marker (local time) for a timestamp, e.g. `2025-11-16`
pub fn day_key(millis: i64) -> String {
    local_time(millis).format("%Y-%m-%d").to_string()
}

/// Epoch millis of local midnight on the day containing `millis`
pub fn start_of_day(millis: i64) -> i64 {
    let date = local_time(millis).date_naive();
    let midnight = date.and_time(NaiveTime::MIN);

    match Local.from_local_datetime(&midnight) {
        LocalResult::Single(t) => t.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        // Midnight skipped by a DST jump; the day starts at the first valid instant
        LocalResult::None => Local
            .from_local_datetime(&(midnight + chrono::Duration::hours(1)))
            .earliest()
            .map(|t| t.timestamp_millis())
            .unwrap_or(millis),
    }
}

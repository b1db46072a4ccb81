use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::quota::access::{self, AccessControlStore};
use crate::quota::enforcement::EnforcementGateway;
use crate::quota::ledger::UsageLedger;
use crate::quota::session::{ActiveSession, SessionId};

/// Depth of the command queue between event sources and the tracker loop
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Foreground-change notification
///
/// `timestamp` is clamped into the tracker clock's past and never precedes
/// the previous change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundEvent {
    pub package_id: String,
    pub timestamp: i64,
}

/// Snapshot of the tracker's state
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStatus {
    pub active: Option<ActiveSession>,
    pub sessions_opened: u64,
    pub breaches: u64,
}

/// Commands processed one at a time by the tracker loop
#[derive(Debug)]
enum Command {
    ForegroundChanged(ForegroundEvent),
    TickFired(SessionId),
    Status(oneshot::Sender<TrackerStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Real-time foreground session tracker
///
/// Owns the single live session. Every mutation of that session happens on
/// one task that drains a command queue, so a foreground change always
/// closes and commits the previous session before the next one opens, and a
/// tick for a superseded session is recognised by its id and dropped.
pub struct ForegroundSessionTracker {
    ledger: Arc<dyn UsageLedger>,
    access: Arc<dyn AccessControlStore>,
    gateway: Arc<dyn EnforcementGateway>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
}

impl ForegroundSessionTracker {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        access: Arc<dyn AccessControlStore>,
        gateway: Arc<dyn EnforcementGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            access,
            gateway,
            clock,
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Set the in-session limit check period
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Start the tracker loop on the current tokio runtime
    pub fn spawn(self) -> TrackerHandle {
        let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let mut state = SessionTracker {
            ledger: self.ledger,
            access: self.access,
            gateway: self.gateway,
            clock: self.clock,
            tick_interval: self.tick_interval,
            commands: tx.downgrade(),
            active: None,
            ticker: None,
            next_id: 1,
            sessions_opened: 0,
            breaches: 0,
            last_event_at: i64::MIN,
        };

        info!(
            "Starting foreground session tracker (tick {}ms)",
            self.tick_interval.as_millis()
        );

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::ForegroundChanged(event) => state.on_foreground_changed(event),
                    Command::TickFired(id) => state.on_tick(id),
                    Command::Status(reply) => {
                        let _ = reply.send(state.status());
                    }
                    Command::Shutdown(reply) => {
                        rx.close();
                        state.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                }
            }

            // Every handle dropped without an explicit shutdown
            state.shutdown();
        });

        TrackerHandle { commands: tx }
    }
}

/// Cloneable handle used to feed and query a running tracker
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<Command>,
}

impl TrackerHandle {
    /// Report that `package_id` came to the foreground at `timestamp`
    pub async fn foreground_changed(&self, package_id: impl Into<String>, timestamp: i64) -> Result<()> {
        let event = ForegroundEvent {
            package_id: package_id.into(),
            timestamp,
        };
        self.commands
            .send(Command::ForegroundChanged(event))
            .await
            .ok()
            .context("Foreground tracker is not running")
    }

    /// Current session and counters
    pub async fn status(&self) -> Result<TrackerStatus> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Status(reply))
            .await
            .ok()
            .context("Foreground tracker is not running")?;
        response.await.context("Foreground tracker stopped before replying")
    }

    /// Commit the active session and stop the tracker
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(reply))
            .await
            .ok()
            .context("Foreground tracker is not running")?;
        done.await.context("Foreground tracker stopped before acknowledging shutdown")
    }
}

/// State owned by the tracker loop
struct SessionTracker {
    ledger: Arc<dyn UsageLedger>,
    access: Arc<dyn AccessControlStore>,
    gateway: Arc<dyn EnforcementGateway>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    commands: mpsc::WeakSender<Command>,
    active: Option<ActiveSession>,
    ticker: Option<JoinHandle<()>>,
    next_id: SessionId,
    sessions_opened: u64,
    breaches: u64,
    /// Effective time of the last applied foreground change
    last_event_at: i64,
}

impl SessionTracker {
    fn on_foreground_changed(&mut self, event: ForegroundEvent) {
        if self
            .active
            .as_ref()
            .is_some_and(|s| s.package_id == event.package_id)
        {
            debug!("Already tracking {}", event.package_id);
            return;
        }

        // Event times never run ahead of the clock ticks are checked against,
        // nor behind the previous change
        let now = event.timestamp.min(self.clock.now_millis()).max(self.last_event_at);
        if now != event.timestamp {
            debug!(
                "Adjusted foreground time for {} from {} to {}",
                event.package_id, event.timestamp, now
            );
        }
        self.last_event_at = now;

        if let Err(e) = self.ledger.reset_if_new_day(now) {
            error!("Failed to check daily usage reset: {:#}", e);
        }

        self.close_active(now);
        self.open_session(event.package_id, now);
    }

    fn open_session(&mut self, package_id: String, now: i64) {
        let (base_usage, limit_minutes) = match self.ledger.snapshot() {
            Ok(snapshot) => snapshot
                .get(&package_id)
                .map(|r| (r.used_millis_today, r.limit_minutes))
                .unwrap_or((0, None)),
            Err(e) => {
                error!("Failed to read usage for {}: {:#}", package_id, e);
                (0, None)
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        self.sessions_opened += 1;

        let mut session = ActiveSession::new(id, package_id, now, base_usage, limit_minutes);
        debug!(
            "Opened session {} for {} (base {}ms, limit {:?})",
            id, session.package_id, base_usage, limit_minutes
        );

        if session.is_breached(now) {
            info!("{} opened with its quota already used up", session.package_id);
            session.exhausted = true;
            let package_id = session.package_id.clone();
            self.active = Some(session);
            self.enforce(&package_id);
            return;
        }

        if session.limit_minutes.is_some() {
            self.ticker = Some(spawn_ticker(self.commands.clone(), id, self.tick_interval));
        }
        self.active = Some(session);
    }

    fn on_tick(&mut self, id: SessionId) {
        let now = self.clock.now_millis();
        let breached = match &self.active {
            Some(session) if session.id == id && !session.exhausted => session.is_breached(now),
            _ => {
                debug!("Dropping stale tick for session {}", id);
                return;
            }
        };

        if !breached {
            return;
        }

        if let Some(package_id) = self.close_active(now) {
            info!("Time limit reached for {}", package_id);
            self.enforce(&package_id);
        }
    }

    /// Commit and drop the active session, returning its package
    fn close_active(&mut self, now: i64) -> Option<String> {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }

        let session = self.active.take()?;
        let elapsed = session.elapsed_millis(now);
        if elapsed > 0 {
            let delta = HashMap::from([(session.package_id.clone(), elapsed)]);
            match self.ledger.apply_delta(&delta) {
                Ok(()) => debug!("Recorded {}ms for {}", elapsed, session.package_id),
                Err(e) => error!(
                    "Failed to record {}ms for {}: {:#}",
                    elapsed, session.package_id, e
                ),
            }
        }
        Some(session.package_id)
    }

    fn enforce(&mut self, package_id: &str) {
        self.breaches += 1;

        match access::revoke(self.access.as_ref(), package_id) {
            Ok(true) => info!("Removed {} from the allow-list", package_id),
            Ok(false) => debug!("{} was not on the allow-list", package_id),
            Err(e) => error!("Failed to revoke {}: {:#}", package_id, e),
        }

        if let Err(e) = self.gateway.on_limit_exceeded(package_id) {
            warn!("Enforcement gateway failed for {}: {:#}", package_id, e);
        }
    }

    fn status(&self) -> TrackerStatus {
        TrackerStatus {
            active: self.active.clone(),
            sessions_opened: self.sessions_opened,
            breaches: self.breaches,
        }
    }

    fn shutdown(&mut self) {
        let now = self.clock.now_millis();
        if let Some(package_id) = self.close_active(now) {
            info!("Closed session for {} on shutdown", package_id);
        }
        info!("Foreground session tracker stopped");
    }
}

/// Periodically ask the tracker loop to re-check session `id`
fn spawn_ticker(
    commands: mpsc::WeakSender<Command>,
    id: SessionId,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(commands) = commands.upgrade() else {
                break;
            };
            // A full queue just skips this tick; the next one re-checks
            if let Err(mpsc::error::TrySendError::Closed(_)) =
                commands.try_send(Command::TickFired(id))
            {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota::access::MemoryAccessStore;
    use crate::quota::enforcement::RecordingGateway;
    use crate::quota::ledger::{MemoryUsageLedger, UsageSnapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: i64 = 1_763_290_000_000;

    /// Ledger wrapper counting delta writes
    #[derive(Default)]
    struct CountingLedger {
        inner: MemoryUsageLedger,
        deltas: AtomicUsize,
        fail_deltas: bool,
    }

    impl UsageLedger for CountingLedger {
        fn snapshot(&self) -> Result<UsageSnapshot> {
            self.inner.snapshot()
        }
        fn apply_delta(&self, deltas: &HashMap<String, i64>) -> Result<()> {
            self.deltas.fetch_add(1, Ordering::SeqCst);
            if self.fail_deltas {
                anyhow::bail!("disk full");
            }
            self.inner.apply_delta(deltas)
        }
        fn reset_if_new_day(&self, now_millis: i64) -> Result<bool> {
            self.inner.reset_if_new_day(now_millis)
        }
        fn set_limits(&self, limits: &HashMap<String, Option<u32>>) -> Result<()> {
            self.inner.set_limits(limits)
        }
        fn day_marker(&self) -> Result<Option<String>> {
            self.inner.day_marker()
        }
        fn last_reconciled_at(&self) -> Result<Option<i64>> {
            self.inner.last_reconciled_at()
        }
        fn set_last_reconciled_at(&self, millis: i64) -> Result<()> {
            self.inner.set_last_reconciled_at(millis)
        }
    }

    struct Fixture {
        ledger: Arc<CountingLedger>,
        access: Arc<MemoryAccessStore>,
        gateway: Arc<RecordingGateway>,
        clock: Arc<ManualClock>,
        handle: TrackerHandle,
    }

    fn fixture_with(ledger: CountingLedger, allowed: &[&str]) -> Fixture {
        let ledger = Arc::new(ledger);
        let access = Arc::new(MemoryAccessStore::with_allowed(allowed.iter().copied()));
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(T0));

        let handle = ForegroundSessionTracker::new(
            ledger.clone(),
            access.clone(),
            gateway.clone(),
            clock.clone(),
        )
        .with_tick_interval(Duration::from_millis(10))
        .spawn();

        Fixture {
            ledger,
            access,
            gateway,
            clock,
            handle,
        }
    }

    fn fixture(allowed: &[&str]) -> Fixture {
        fixture_with(CountingLedger::default(), allowed)
    }

    fn used(f: &Fixture, package_id: &str) -> i64 {
        f.ledger
            .snapshot()
            .unwrap()
            .get(package_id)
            .map(|r| r.used_millis_today)
            .unwrap_or(0)
    }

    /// Move the clock to `at` and report `package_id` in the foreground
    async fn switch_to(f: &Fixture, package_id: &str, at: i64) {
        f.clock.set(at);
        f.handle.foreground_changed(package_id, at).await.unwrap();
    }

    async fn wait_for_breach(f: &Fixture, package_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.gateway.count_for(package_id) == 0 {
            assert!(Instant::now() < deadline, "no breach reported for {}", package_id);
            time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_tick_breach_commits_and_enforces_once() {
        let f = fixture(&["game"]);
        f.ledger
            .set_limits(&HashMap::from([("game".to_string(), Some(10))]))
            .unwrap();
        f.ledger
            .apply_delta(&HashMap::from([("game".to_string(), 590_000)]))
            .unwrap();

        f.handle.foreground_changed("game", T0).await.unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.active.as_ref().unwrap().base_usage_millis, 590_000);

        f.clock.set(T0 + 11_000);
        wait_for_breach(&f, "game").await;

        let status = f.handle.status().await.unwrap();
        assert!(status.active.is_none());
        assert_eq!(used(&f, "game"), 601_000);
        assert!(!f.access.allowed().unwrap().contains("game"));

        // Further ticks have nothing to act on
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.gateway.count_for("game"), 1);
        assert_eq!(used(&f, "game"), 601_000);
    }

    #[tokio::test]
    async fn test_exhausted_on_open_enforces_without_ticking() {
        let f = fixture(&["game", "notes"]);
        f.ledger
            .set_limits(&HashMap::from([("game".to_string(), Some(1))]))
            .unwrap();
        f.ledger
            .apply_delta(&HashMap::from([("game".to_string(), 60_000)]))
            .unwrap();

        switch_to(&f, "game", T0).await;
        switch_to(&f, "game", T0 + 500).await;
        let status = f.handle.status().await.unwrap();

        assert!(status.active.as_ref().unwrap().exhausted);
        assert_eq!(f.gateway.count_for("game"), 1);
        assert_eq!(f.access.allowed().unwrap().len(), 1);

        // Time spent in the exhausted app is still committed when it leaves
        switch_to(&f, "notes", T0 + 2_000).await;
        f.handle.status().await.unwrap();
        assert_eq!(used(&f, "game"), 62_000);
    }

    #[tokio::test]
    async fn test_duplicate_events_are_idempotent() {
        let f = fixture(&[]);

        for offset in [0, 1_000, 2_000, 3_000] {
            switch_to(&f, "reader", T0 + offset).await;
        }
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.sessions_opened, 1);
        assert_eq!(status.active.unwrap().started_at_millis, T0);
        assert_eq!(f.ledger.deltas.load(Ordering::SeqCst), 0);

        switch_to(&f, "browser", T0 + 5_000).await;
        f.handle.status().await.unwrap();
        assert_eq!(f.ledger.deltas.load(Ordering::SeqCst), 1);
        assert_eq!(used(&f, "reader"), 5_000);
    }

    #[tokio::test]
    async fn test_committed_time_matches_session_lengths() {
        let f = fixture(&[]);
        let events = [
            ("a", 0),
            ("b", 4_000),
            ("a", 4_000), // zero-length session for b
            ("c", 10_000),
            ("a", 11_500),
            ("b", 20_000),
        ];
        for (pkg, offset) in events {
            switch_to(&f, pkg, T0 + offset).await;
        }
        f.clock.set(T0 + 25_000);
        f.handle.shutdown().await.unwrap();

        assert_eq!(used(&f, "a"), 4_000 + 6_000 + 8_500);
        assert_eq!(used(&f, "b"), 5_000);
        assert_eq!(used(&f, "c"), 1_500);
        // a, a, c, a, b(shutdown): the zero-length b session wrote nothing
        assert_eq!(f.ledger.deltas.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_shutdown_commits_active_session() {
        let f = fixture(&[]);
        f.handle.foreground_changed("game", T0).await.unwrap();
        f.clock.set(T0 + 7_000);
        f.handle.shutdown().await.unwrap();

        assert_eq!(used(&f, "game"), 7_000);
        assert!(f.handle.foreground_changed("game", T0).await.is_err());
    }

    #[tokio::test]
    async fn test_ledger_failures_do_not_stop_tracker() {
        let ledger = CountingLedger {
            fail_deltas: true,
            ..Default::default()
        };
        let f = fixture_with(ledger, &[]);

        switch_to(&f, "a", T0).await;
        switch_to(&f, "b", T0 + 1_000).await;
        switch_to(&f, "c", T0 + 2_000).await;

        let status = f.handle.status().await.unwrap();
        assert_eq!(status.sessions_opened, 3);
        assert_eq!(status.active.unwrap().package_id, "c");
        assert_eq!(f.ledger.deltas.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_tick_is_ignored() {
        let clock = Arc::new(ManualClock::new(T0));
        let ledger = Arc::new(MemoryUsageLedger::new());
        ledger
            .set_limits(&HashMap::from([
                ("a".to_string(), Some(1)),
                ("b".to_string(), Some(1)),
            ]))
            .unwrap();
        let gateway = Arc::new(RecordingGateway::new());
        let (tx, _rx) = mpsc::channel(8);

        let mut tracker = SessionTracker {
            ledger: ledger.clone(),
            access: Arc::new(MemoryAccessStore::new()),
            gateway: gateway.clone(),
            clock: clock.clone(),
            tick_interval: Duration::from_secs(3600),
            commands: tx.downgrade(),
            active: None,
            ticker: None,
            next_id: 1,
            sessions_opened: 0,
            breaches: 0,
            last_event_at: i64::MIN,
        };

        tracker.on_foreground_changed(ForegroundEvent {
            package_id: "a".to_string(),
            timestamp: T0,
        });
        let first = tracker.active.as_ref().unwrap().id;
        clock.set(T0 + 1_000);
        tracker.on_foreground_changed(ForegroundEvent {
            package_id: "b".to_string(),
            timestamp: T0 + 1_000,
        });

        // Well past both limits, but the tick names the superseded session
        clock.set(T0 + 600_000);
        tracker.on_tick(first);
        assert_eq!(tracker.active.as_ref().unwrap().package_id, "b");
        assert!(gateway.breaches().is_empty());

        let current = tracker.active.as_ref().unwrap().id;
        tracker.on_tick(current);
        assert!(tracker.active.is_none());
        assert_eq!(gateway.breaches(), vec!["b"]);
        assert_eq!(ledger.snapshot().unwrap()["b"].used_millis_today, 599_000);
    }

    #[tokio::test]
    async fn test_skewed_event_times_are_clamped() {
        let f = fixture(&["game"]);
        f.ledger
            .set_limits(&HashMap::from([("game".to_string(), Some(10))]))
            .unwrap();

        // A timestamp from a clock far ahead must not open a breached session
        f.clock.set(T0 + 5_000);
        f.handle.foreground_changed("game", T0 + 3_600_000).await.unwrap();
        let status = f.handle.status().await.unwrap();
        let active = status.active.unwrap();
        assert_eq!(active.started_at_millis, T0 + 5_000);
        assert!(!active.exhausted);

        // A stale timestamp does not reach back before the previous change
        f.clock.set(T0 + 8_000);
        f.handle.foreground_changed("notes", T0).await.unwrap();
        let status = f.handle.status().await.unwrap();
        assert_eq!(status.active.unwrap().started_at_millis, T0 + 5_000);
        assert_eq!(used(&f, "game"), 0);
        assert!(f.gateway.breaches().is_empty());
        assert!(f.access.allowed().unwrap().contains("game"));
    }
}

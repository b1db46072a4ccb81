use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MILLIS_PER_MINUTE, start_of_day};
use crate::config::ReconcileStrategy;
use crate::quota::access::AccessControlStore;
use crate::quota::enforcement::EnforcementGateway;
use crate::quota::ledger::{UsageLedger, UsageSnapshot};
use crate::quota::scheduler::ReconcileSchedule;
use crate::quota::usage_source::{UsageEvent, UsageEventKind, UsageStatsProvider};

/// Replay window used when no previous pass has been recorded
const DEFAULT_REPLAY_WINDOW_MILLIS: i64 = 15 * MILLIS_PER_MINUTE;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Usage permission was missing, nothing was touched
    pub skipped: bool,
    pub day_reset: bool,
    pub deltas_applied: usize,
    pub millis_added: i64,
    pub revoked: Vec<String>,
}

/// Periodic reconciliation of the ledger against OS usage statistics
///
/// Every step only adds non-negative deltas or removes packages, so a pass can
/// interleave with the foreground tracker and can be rerun after a restart.
pub struct Reconciler {
    ledger: Arc<dyn UsageLedger>,
    access: Arc<dyn AccessControlStore>,
    usage: Arc<dyn UsageStatsProvider>,
    gateway: Option<Arc<dyn EnforcementGateway>>,
    clock: Arc<dyn Clock>,
    strategy: ReconcileStrategy,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn UsageLedger>,
        access: Arc<dyn AccessControlStore>,
        usage: Arc<dyn UsageStatsProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            access,
            usage,
            gateway: None,
            clock,
            strategy: ReconcileStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: ReconcileStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Report packages revoked by a pass to `gateway`
    pub fn with_gateway(mut self, gateway: Arc<dyn EnforcementGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Run one pass at the clock's current time
    pub fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        if !self.usage.has_usage_permission() {
            debug!("Usage access not granted, skipping reconciliation");
            report.skipped = true;
            return Ok(report);
        }

        let now = self.clock.now_millis();
        report.day_reset = self.ledger.reset_if_new_day(now)?;

        let deltas = match self.strategy {
            ReconcileStrategy::Aggregated => {
                let totals = self.usage.query_aggregated(start_of_day(now), now)?;
                aggregated_deltas(&totals, &self.ledger.snapshot()?)
            }
            ReconcileStrategy::EventReplay => {
                let window_start = self
                    .ledger
                    .last_reconciled_at()?
                    .unwrap_or(now - DEFAULT_REPLAY_WINDOW_MILLIS)
                    .max(start_of_day(now));
                let events = self.usage.query_events(window_start, now)?;
                replay_events(&events, now)
            }
        };

        if !deltas.is_empty() {
            self.ledger.apply_delta(&deltas)?;
            report.deltas_applied = deltas.len();
            report.millis_added = deltas.values().sum();
        }

        if self.strategy == ReconcileStrategy::EventReplay {
            self.ledger.set_last_reconciled_at(now)?;
        }

        report.revoked = self.revoke_exhausted()?;

        info!(
            "Reconciled usage: {} package(s), +{}ms, {} revoked{}",
            report.deltas_applied,
            report.millis_added,
            report.revoked.len(),
            if report.day_reset { ", daily reset" } else { "" }
        );
        Ok(report)
    }

    fn revoke_exhausted(&self) -> Result<Vec<String>> {
        let allowed = self.access.allowed()?;
        if allowed.is_empty() {
            return Ok(Vec::new());
        }

        let exhausted = exhausted_packages(&allowed, &self.ledger.snapshot()?);
        if exhausted.is_empty() {
            return Ok(exhausted);
        }

        // Packages the tracker revoked in the meantime are not reported again
        let revoked = self.access.remove_allowed(&exhausted)?;

        for package_id in &revoked {
            info!("Quota exhausted for {}, removed from the allow-list", package_id);
            if let Some(gateway) = &self.gateway {
                if let Err(e) = gateway.on_limit_exceeded(package_id) {
                    warn!("Enforcement gateway failed for {}: {:#}", package_id, e);
                }
            }
        }
        Ok(revoked)
    }

    /// Run passes forever on `schedule`
    ///
    /// A pass never awaits, so aborting the returned task can only land between
    /// passes, never inside one.
    pub fn spawn(self, schedule: ReconcileSchedule) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting usage reconciliation (every {}s, first run in {}s)",
                schedule.period().as_secs(),
                schedule.initial_delay().as_secs()
            );

            for pass in 0.. {
                let delay = schedule.delay_before(pass);
                debug!(
                    "Next reconciliation at: {}",
                    ReconcileSchedule::run_at(delay).format("%Y-%m-%d %H:%M:%S %Z")
                );
                tokio::time::sleep(delay).await;

                if let Err(e) = self.run_once() {
                    error!("Usage reconciliation failed: {:#}", e);
                }
            }
        })
    }
}

/// Positive differences between OS totals and what the ledger already holds
///
/// Totals at or below the recorded value contribute nothing, so time the
/// foreground tracker already captured is not counted twice.
pub fn aggregated_deltas(totals: &HashMap<String, i64>, snapshot: &UsageSnapshot) -> HashMap<String, i64> {
    totals
        .iter()
        .filter_map(|(package_id, total)| {
            let recorded = snapshot
                .get(package_id)
                .map(|r| r.used_millis_today)
                .unwrap_or(0);
            (*total > recorded).then(|| (package_id.clone(), total - recorded))
        })
        .collect()
}

/// Foreground time per package reconstructed from raw events
///
/// Foreground starts still open at the end of the window are closed at `now`.
pub fn replay_events(events: &[UsageEvent], now: i64) -> HashMap<String, i64> {
    let mut deltas: HashMap<String, i64> = HashMap::new();
    let mut starts: HashMap<&str, i64> = HashMap::new();

    for event in events {
        match event.kind {
            UsageEventKind::Foreground => {
                starts.insert(&event.package_id, event.timestamp);
            }
            UsageEventKind::Background => {
                if let Some(start) = starts.remove(event.package_id.as_str()) {
                    let delta = event.timestamp - start;
                    if delta > 0 {
                        *deltas.entry(event.package_id.clone()).or_default() += delta;
                    }
                }
            }
        }
    }

    for (package_id, start) in starts {
        let delta = now - start;
        if delta > 0 {
            *deltas.entry(package_id.to_string()).or_default() += delta;
        }
    }

    deltas
}

/// Allowed packages whose set limit has no minutes left
pub fn exhausted_packages(allowed: &BTreeSet<String>, snapshot: &UsageSnapshot) -> Vec<String> {
    allowed
        .iter()
        .filter(|package_id| snapshot.get(*package_id).is_some_and(|r| r.is_exhausted()))
        .cloned()
        .collect()
}

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::platform::{ensure_directory_exists, is_privileged};
use crate::quota::{
    AppEnforcer, EnforcementGateway, FileAccessStore, FileUsageLedger, ForegroundSessionTracker,
    JsonReportSource, ReconcileSchedule, Reconciler, StaticUsageSource, TrackerHandle,
    UsageStatsProvider,
};

/// Ledger directory under the state directory
pub const LEDGER_DIR: &str = "ledger";
/// Allow-list file under the state directory
pub const ACCESS_FILE: &str = "access.json";

/// Durable stores and collaborators opened from a configuration
pub struct Engine {
    pub config: EngineConfig,
    pub ledger: Arc<FileUsageLedger>,
    pub access: Arc<FileAccessStore>,
    pub usage: Arc<dyn UsageStatsProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Engine {
    /// Open the stores under the configured state directory
    pub fn open(config: EngineConfig) -> Result<Self> {
        let state_dir = config.state_dir()?;
        Self::open_in(config, &state_dir)
    }

    /// Open the stores under `state_dir`, ignoring the configured one
    pub fn open_in(config: EngineConfig, state_dir: &Path) -> Result<Self> {
        ensure_directory_exists(state_dir)
            .with_context(|| format!("Failed to prepare state directory: {}", state_dir.display()))?;

        let usage: Arc<dyn UsageStatsProvider> = match &config.reconcile.usage_report {
            Some(path) => Arc::new(JsonReportSource::new(path)),
            None => {
                // No usage statistics available: every pass is skipped
                let source = StaticUsageSource::new();
                source.set_permitted(false);
                Arc::new(source)
            }
        };

        Ok(Self {
            ledger: Arc::new(FileUsageLedger::new(state_dir.join(LEDGER_DIR))),
            access: Arc::new(FileAccessStore::new(state_dir.join(ACCESS_FILE))),
            usage,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    pub fn gateway(&self) -> Arc<dyn EnforcementGateway> {
        Arc::new(AppEnforcer::new(self.config.enforcement.clone()))
    }

    pub fn reconciler(&self, gateway: Arc<dyn EnforcementGateway>) -> Reconciler {
        Reconciler::new(
            self.ledger.clone(),
            self.access.clone(),
            self.usage.clone(),
            self.clock.clone(),
        )
        .with_strategy(self.config.reconcile.strategy)
        .with_gateway(gateway)
    }

    pub fn tracker(&self, gateway: Arc<dyn EnforcementGateway>) -> ForegroundSessionTracker {
        ForegroundSessionTracker::new(
            self.ledger.clone(),
            self.access.clone(),
            gateway,
            self.clock.clone(),
        )
        .with_tick_interval(self.config.tracker.tick_interval())
    }
}

/// Run the engine until Ctrl-C
///
/// Foreground changes are read from stdin, one `<package_id> [timestamp_millis]`
/// record per line.
pub async fn run_daemon(config: EngineConfig) -> Result<()> {
    if !is_privileged() {
        tracing::warn!("Not running with elevated privileges; closing other users' apps may fail");
    }

    let engine = Engine::open(config)?;
    tracing::info!("Starting quota engine");
    tracing::info!("State directory: {}", engine.ledger.root().display());
    tracing::info!(
        "Reconcile interval: {} seconds (+{} seconds jitter)",
        engine.config.reconcile.interval_secs,
        engine.config.reconcile.jitter_secs
    );
    if engine.config.reconcile.usage_report.is_none() {
        tracing::warn!("No usage report configured, reconciliation passes will be skipped");
    }

    let gateway = engine.gateway();
    let tracker = engine.tracker(gateway.clone()).spawn();

    let reconcile_task = engine
        .reconciler(gateway)
        .spawn(ReconcileSchedule::from_config(&engine.config.reconcile));

    let feed = tokio::spawn(read_foreground_feed(tracker.clone(), engine.clock.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    feed.abort();
    reconcile_task.abort();
    tracker.shutdown().await?;

    tracing::info!("Quota engine stopped");
    Ok(())
}

/// Forward stdin records to the tracker until EOF
async fn read_foreground_feed(tracker: TrackerHandle, clock: Arc<dyn Clock>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some((package_id, timestamp)) = parse_feed_line(&line, clock.now_millis()) else {
                    continue;
                };
                if let Err(e) = tracker.foreground_changed(package_id, timestamp).await {
                    tracing::error!("Failed to forward foreground change: {:#}", e);
                    return;
                }
            }
            Ok(None) => {
                tracing::info!("Foreground feed closed");
                return;
            }
            Err(e) => {
                tracing::error!("Failed to read foreground feed: {:#}", e);
                return;
            }
        }
    }
}

/// Parse one `<package_id> [timestamp_millis]` record
///
/// Blank lines yield `None`; a missing or unparsable timestamp means `now_millis`.
pub fn parse_feed_line(line: &str, now_millis: i64) -> Option<(String, i64)> {
    let mut parts = line.split_whitespace();
    let package_id = parts.next()?;

    let timestamp = match parts.next() {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid timestamp '{}' for {}", raw, package_id);
            now_millis
        }),
        None => now_millis,
    };

    Some((package_id.to_string(), timestamp))
}

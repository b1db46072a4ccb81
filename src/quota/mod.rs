/// Per-application daily quota engine
///
/// This module provides functionality to:
/// - Persist per-package usage and limits for the current day
/// - Keep the allow-list of packages the user may launch
/// - Time foreground sessions and enforce limits while an app is open
/// - Reconcile the ledger against OS usage statistics on a schedule

pub mod access;
pub mod enforcement;
pub mod ledger;
pub mod platform;
pub mod reconcile;
pub mod scheduler;
pub mod selection;
pub mod session;
pub mod tracker;
pub mod usage_source;

pub use access::{AccessControlStore, AllowListState, FileAccessStore, MemoryAccessStore};
pub use enforcement::{AppEnforcer, EnforcementGateway, RecordingGateway};
pub use ledger::{FileUsageLedger, MemoryUsageLedger, UsageLedger, UsageRecord, UsageSnapshot};
pub use reconcile::{ReconcileReport, Reconciler};
pub use scheduler::ReconcileSchedule;
pub use selection::{apply_selection, visible_packages};
pub use session::{ActiveSession, SessionId};
pub use tracker::{ForegroundEvent, ForegroundSessionTracker, TrackerHandle, TrackerStatus};
pub use usage_source::{
    JsonReportSource, StaticUsageSource, UsageEvent, UsageEventKind, UsageReport,
    UsageStatsProvider,
};

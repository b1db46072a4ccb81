//! Per-application daily screen-time quotas.
//!
//! The engine keeps a per-day usage ledger, an allow-list of launchable
//! packages, a foreground session tracker that enforces limits while an app is
//! open, and a periodic reconciliation against OS usage statistics.

pub mod clock;
pub mod config;
pub mod daemon;
pub mod platform;
pub mod quota;

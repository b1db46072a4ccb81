use chrono::{DateTime, Local};
use rand::Rng;
use std::time::Duration;

use crate::config::ReconcileConfig;

/// When reconciliation passes run
///
/// The first pass waits for `initial_delay`; every later one waits one
/// period plus a random jitter so passes drift away from clock boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSchedule {
    period: Duration,
    jitter: Duration,
    initial_delay: Duration,
}

impl ReconcileSchedule {
    pub fn new(period: Duration, jitter: Duration) -> Self {
        Self {
            period,
            jitter,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Schedule described by the `[reconcile]` section
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(
            Duration::from_secs(config.interval_secs),
            Duration::from_secs(config.jitter_secs),
        )
        .with_initial_delay(Duration::from_secs(config.initial_delay_secs))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Wait before pass number `pass`, counting from zero
    pub fn delay_before(&self, pass: u64) -> Duration {
        if pass == 0 {
            self.initial_delay
        } else {
            self.period + self.random_jitter()
        }
    }

    /// Wall-clock time a pass waiting `delay` from now will start
    pub fn run_at(delay: Duration) -> DateTime<Local> {
        Local::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }

    fn random_jitter(&self) -> Duration {
        let max_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_millis))
    }
}

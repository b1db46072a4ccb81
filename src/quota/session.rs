use serde::Serialize;

use crate::quota::ledger::limit_to_millis;

/// Identifier of one foreground session, unique within a tracker's lifetime
pub type SessionId = u64;

/// Live foreground session (in memory only, never persisted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub id: SessionId,
    pub package_id: String,
    pub started_at_millis: i64,
    pub base_usage_millis: i64,
    pub limit_minutes: Option<u32>,
    /// Set once the session's package has been revoked for this breach
    pub exhausted: bool,
}

impl ActiveSession {
    pub fn new(
        id: SessionId,
        package_id: String,
        started_at_millis: i64,
        base_usage_millis: i64,
        limit_minutes: Option<u32>,
    ) -> Self {
        Self {
            id,
            package_id,
            started_at_millis,
            base_usage_millis,
            limit_minutes,
            exhausted: false,
        }
    }

    /// Time spent in this session so far, floored at zero
    pub fn elapsed_millis(&self, now_millis: i64) -> i64 {
        (now_millis - self.started_at_millis).max(0)
    }

    /// Usage today including the uncommitted part of this session
    pub fn live_usage_millis(&self, now_millis: i64) -> i64 {
        self.base_usage_millis + self.elapsed_millis(now_millis)
    }

    /// Whether live usage has reached the limit; always false without one
    pub fn is_breached(&self, now_millis: i64) -> bool {
        match self.limit_minutes {
            Some(limit) => self.live_usage_millis(now_millis) >= limit_to_millis(limit),
            None => false,
        }
    }
}

use anyhow::Result;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::{EnforcementAction, EnforcementConfig};
use crate::quota::platform;

/// Receiver of quota breaches
///
/// Implementations move the user away from the exhausted application. The
/// engine calls this at most once per breach and never retries it.
pub trait EnforcementGateway: Send + Sync {
    fn on_limit_exceeded(&self, package_id: &str) -> Result<()>;
}

/// Gateway that notifies the user and closes the exhausted application
pub struct AppEnforcer {
    config: EnforcementConfig,
}

impl AppEnforcer {
    pub fn new(config: EnforcementConfig) -> Self {
        Self { config }
    }

    fn send_notification(&self, package_id: &str) {
        let message = format!(
            "Today's time for {} is used up. It will be available again tomorrow.",
            package_id
        );
        if let Err(e) = platform::notify("Time Limit Reached", &message) {
            warn!("Failed to show notification for {}: {:#}", package_id, e);
        }
    }
}

impl EnforcementGateway for AppEnforcer {
    fn on_limit_exceeded(&self, package_id: &str) -> Result<()> {
        info!("Enforcing time limit for {}", package_id);

        if self.config.notify {
            self.send_notification(package_id);
        }

        if self.config.action == EnforcementAction::Terminate {
            platform::close_app(package_id)?;
            info!("Closed {}", package_id);
        }

        if !self.config.home_command.is_empty() {
            platform::run_command(&self.config.home_command)?;
        }

        Ok(())
    }
}

/// Gateway that records breaches in memory, for embedding hosts that poll
/// and for tests
#[derive(Debug, Default)]
pub struct RecordingGateway {
    breaches: Mutex<Vec<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packages reported so far, in order
    pub fn breaches(&self) -> Vec<String> {
        self.breaches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn count_for(&self, package_id: &str) -> usize {
        self.breaches().iter().filter(|p| *p == package_id).count()
    }
}

impl EnforcementGateway for RecordingGateway {
    fn on_limit_exceeded(&self, package_id: &str) -> Result<()> {
        self.breaches
            .lock()
            .map_err(|_| anyhow::anyhow!("recording gateway lock poisoned"))?
            .push(package_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_gateway_counts() {
        let gateway = RecordingGateway::new();
        gateway.on_limit_exceeded("a").unwrap();
        gateway.on_limit_exceeded("b").unwrap();
        gateway.on_limit_exceeded("a").unwrap();

        assert_eq!(gateway.breaches(), vec!["a", "b", "a"]);
        assert_eq!(gateway.count_for("a"), 2);
        assert_eq!(gateway.count_for("c"), 0);
    }

    #[test]
    fn test_notify_only_enforcer_does_not_fail() {
        let enforcer = AppEnforcer::new(EnforcementConfig {
            action: EnforcementAction::Notify,
            notify: false,
            home_command: Vec::new(),
        });
        assert!(enforcer.on_limit_exceeded("com.example.game").is_ok());
    }

    #[test]
    fn test_home_command_failure_is_reported() {
        let enforcer = AppEnforcer::new(EnforcementConfig {
            action: EnforcementAction::Notify,
            notify: false,
            home_command: vec!["nonexistent_command_xyz".to_string()],
        });
        assert!(enforcer.on_limit_exceeded("com.example.game").is_err());
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, stored as TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub enforcement: EnforcementConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the ledger and allow-list live
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// State directory (platform default when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

/// Foreground session tracker settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// In-session limit check period (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Periodic reconciliation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// How often to reconcile against OS usage data (seconds)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// Random jitter added to each period (seconds)
    #[serde(default = "default_reconcile_jitter")]
    pub jitter_secs: u64,

    /// Delay before the first pass after start (seconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default)]
    pub strategy: ReconcileStrategy,

    /// Usage report read by the file-backed usage source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_report: Option<PathBuf>,
}

/// How the reconciliation pass derives missed usage
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStrategy {
    /// Diff aggregated per-day totals against the ledger
    #[default]
    Aggregated,
    /// Replay raw foreground/background events since the last pass
    EventReplay,
}

/// What happens to an application whose quota is exhausted
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub action: EnforcementAction,

    /// Show a desktop notification on breach
    #[serde(default = "default_true")]
    pub notify: bool,

    /// Command (argv) that brings the user back to the home surface
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub home_command: Vec<String>,
}

/// Action taken against an exhausted application
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    /// Only notify the user
    Notify,
    /// Close the application's processes
    #[default]
    Terminate,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_reconcile_interval() -> u64 {
    900 // 15 minutes
}

fn default_reconcile_jitter() -> u64 {
    30
}

fn default_initial_delay() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            jitter_secs: default_reconcile_jitter(),
            initial_delay_secs: default_initial_delay(),
            strategy: ReconcileStrategy::default(),
            usage_report: None,
        }
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            action: EnforcementAction::default(),
            notify: default_true(),
            home_command: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TrackerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tracker.tick_interval_ms == 0 {
            anyhow::bail!("tracker.tick_interval_ms must be greater than zero");
        }

        if self.reconcile.interval_secs == 0 {
            anyhow::bail!("reconcile.interval_secs must be greater than zero");
        }

        if self.reconcile.jitter_secs > self.reconcile.interval_secs {
            anyhow::bail!("reconcile.jitter_secs must not exceed reconcile.interval_secs");
        }

        if let Some(program) = self.enforcement.home_command.first() {
            if program.trim().is_empty() {
                anyhow::bail!("enforcement.home_command must start with a program name");
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Unknown log level: {}", other),
        }

        Ok(())
    }

    /// Resolved state directory
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.storage.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_state_dir(),
        }
    }
}

/// Get the platform-specific state directory
pub fn get_state_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/app-quota"))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from("/Library/Application Support/app-quota"))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("app-quota");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        directories::ProjectDirs::from("", "", "app-quota")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine a state directory for this platform")
    }
}

/// Get the default configuration file path
///
/// Uses the per-user config directory, e.g. `~/.config/app-quota/app-quota.toml`.
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "app-quota")
        .context("Could not determine a config directory")?;
    Ok(dirs.config_dir().join("app-quota.toml"))
}

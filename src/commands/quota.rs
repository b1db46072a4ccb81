use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use app_quota::config::EngineConfig;
use app_quota::daemon::{self, Engine};
use app_quota::platform::is_privileged;
use app_quota::quota::{self, AccessControlStore, UsageLedger};

use super::utils::{format_usage, print_sudo_message};

/// Write a default configuration file
pub fn init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            config_path.display()
        );
    }

    EngineConfig::default().save(config_path)?;

    println!("✓ Created configuration file: {}", config_path.display());
    println!("\nSet [reconcile] usage_report to let the engine reconcile against OS usage data.");
    println!("Then start the engine: app-quota run");
    Ok(())
}

/// Run the engine in the foreground
pub fn run(config: EngineConfig) -> Result<()> {
    println!("Starting quota engine in foreground mode...");
    println!("Feed foreground changes on stdin as '<package> [timestamp_millis]'");
    println!("Press Ctrl+C to stop");
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(daemon::run_daemon(config))
}

/// Show today's usage, limits and the allow-list
pub fn status(config: EngineConfig) -> Result<()> {
    let engine = open_engine(config)?;
    engine.ledger.reset_if_new_day(engine.clock.now_millis())?;

    let snapshot = engine.ledger.snapshot()?;
    let allowed = engine.access.allowed()?;
    let locked = engine.access.is_locked()?;

    println!("App Quota Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "Day:        {}",
        engine.ledger.day_marker()?.unwrap_or_else(|| "(not started)".to_string())
    );
    println!("Selection:  {}", if locked { "LOCKED" } else { "unlocked" });
    if let Some(at) = engine.ledger.last_reconciled_at()? {
        if let Some(at) = chrono::DateTime::from_timestamp_millis(at) {
            println!("Last replay: {}", at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S %Z"));
        }
    }

    let mut packages: BTreeSet<&str> = snapshot.keys().map(String::as_str).collect();
    packages.extend(allowed.iter().map(String::as_str));

    println!();
    if packages.is_empty() {
        println!("No packages known yet");
        return Ok(());
    }

    println!("{:<40} {:>8} {:>8} {:>10}  {}", "PACKAGE", "USED", "LIMIT", "REMAINING", "ALLOWED");
    for package_id in packages {
        let record = snapshot.get(package_id);
        let used = record.map(|r| r.used_millis_today).unwrap_or(0);
        let limit = record.and_then(|r| r.limit_minutes);
        let remaining = record.and_then(|r| r.remaining_minutes());

        println!(
            "{:<40} {:>8} {:>8} {:>10}  {}",
            package_id,
            format_usage(used),
            limit.map(|m| format!("{}m", m)).unwrap_or_else(|| "-".to_string()),
            remaining.map(|m| format!("{}m", m)).unwrap_or_else(|| "-".to_string()),
            if allowed.contains(package_id) { "yes" } else { "no" }
        );
    }

    Ok(())
}

/// Add packages to the allow-list
pub fn allow(config: EngineConfig, packages: Vec<String>) -> Result<()> {
    let engine = open_engine(config)?;
    ensure_unlocked(engine.access.as_ref())?;

    let mut allowed = engine.access.allowed()?;
    allowed.extend(packages.iter().cloned());
    engine.access.set_allowed(&allowed)?;

    for package_id in &packages {
        println!("✓ Allowed {}", package_id);
    }
    Ok(())
}

/// Remove packages from the allow-list
pub fn disallow(config: EngineConfig, packages: Vec<String>) -> Result<()> {
    let engine = open_engine(config)?;

    for package_id in &packages {
        if quota::access::revoke(engine.access.as_ref(), package_id)? {
            println!("✓ Removed {}", package_id);
        } else {
            println!("  {} was not allowed", package_id);
        }
    }
    Ok(())
}

/// Replace the allow-list from `PKG[=MINUTES]` entries
pub fn select(config: EngineConfig, entries: Vec<String>, lock: bool) -> Result<()> {
    let engine = open_engine(config)?;
    ensure_unlocked(engine.access.as_ref())?;

    let mut packages = BTreeSet::new();
    let mut limits = HashMap::new();
    for entry in &entries {
        let (package_id, limit) = parse_selection_entry(entry)?;
        if let Some(minutes) = limit {
            limits.insert(package_id.clone(), minutes);
        }
        packages.insert(package_id);
    }

    quota::apply_selection(
        engine.access.as_ref(),
        engine.ledger.as_ref(),
        &packages,
        &limits,
        lock,
    )?;

    println!("✓ Selected {} package(s)", packages.len());
    if lock {
        println!("✓ Selection locked");
    }
    Ok(())
}

/// Set one package's daily limit
pub fn set_limit(config: EngineConfig, package_id: String, minutes: u32) -> Result<()> {
    let engine = open_engine(config)?;
    ensure_unlocked(engine.access.as_ref())?;

    engine
        .ledger
        .set_limits(&HashMap::from([(package_id.clone(), Some(minutes))]))?;
    println!("✓ Limit for {} set to {} minutes", package_id, minutes);
    Ok(())
}

/// Clear one package's daily limit
pub fn clear_limit(config: EngineConfig, package_id: String) -> Result<()> {
    let engine = open_engine(config)?;
    ensure_unlocked(engine.access.as_ref())?;

    engine
        .ledger
        .set_limits(&HashMap::from([(package_id.clone(), None)]))?;
    println!("✓ Limit for {} cleared", package_id);
    Ok(())
}

/// Set or clear the selection lock
pub fn set_locked(config: EngineConfig, locked: bool) -> Result<()> {
    let engine = open_engine(config)?;
    engine.access.set_locked(locked)?;
    println!("✓ Selection {}", if locked { "locked" } else { "unlocked" });
    Ok(())
}

/// Run one reconciliation pass and print its report
pub fn reconcile(config: EngineConfig) -> Result<()> {
    let engine = open_engine(config)?;
    let report = engine.reconciler(engine.gateway()).run_once()?;

    if report.skipped {
        println!("Usage statistics are not available, nothing reconciled");
        return Ok(());
    }

    if report.day_reset {
        println!("✓ Daily usage reset");
    }
    println!(
        "✓ Reconciled {} package(s), added {}",
        report.deltas_applied,
        format_usage(report.millis_added)
    );
    for package_id in &report.revoked {
        println!("  Quota exhausted, removed from allow-list: {}", package_id);
    }
    Ok(())
}

/// Resolve the configuration path from the command line
pub fn config_path(arg: Option<PathBuf>) -> Result<PathBuf> {
    match arg {
        Some(path) => Ok(path),
        None => app_quota::config::get_config_path(),
    }
}

fn open_engine(config: EngineConfig) -> Result<Engine> {
    Engine::open(config).inspect_err(|_| {
        if !is_privileged() {
            print_sudo_message();
        }
    })
}

/// Changes to the selection are refused while it is locked
fn ensure_unlocked(access: &dyn AccessControlStore) -> Result<()> {
    if access.is_locked()? {
        anyhow::bail!("Selection is locked. Run 'app-quota unlock' first.");
    }
    Ok(())
}

/// Parse `PKG` or `PKG=MINUTES`
fn parse_selection_entry(entry: &str) -> Result<(String, Option<u32>)> {
    let (package_id, limit) = match entry.split_once('=') {
        Some((package_id, minutes)) => {
            let minutes = minutes
                .trim()
                .parse::<u32>()
                .with_context(|| format!("Invalid limit in '{}'", entry))?;
            (package_id.trim(), Some(minutes))
        }
        None => (entry.trim(), None),
    };

    if package_id.is_empty() {
        anyhow::bail!("Missing package name in '{}'", entry);
    }
    Ok((package_id.to_string(), limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection_entry() {
        assert_eq!(
            parse_selection_entry("com.example.game=30").unwrap(),
            ("com.example.game".to_string(), Some(30))
        );
        assert_eq!(
            parse_selection_entry("com.example.reader").unwrap(),
            ("com.example.reader".to_string(), None)
        );
        assert!(parse_selection_entry("game=lots").is_err());
        assert!(parse_selection_entry("=10").is_err());
    }

    #[test]
    fn test_ensure_unlocked() {
        let access = quota::MemoryAccessStore::new();
        assert!(ensure_unlocked(&access).is_ok());
        access.set_locked(true).unwrap();
        assert!(ensure_unlocked(&access).is_err());
    }
}

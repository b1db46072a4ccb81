use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Per-application daily screen-time quotas
///
/// Tracks foreground usage per application, keeps a daily usage ledger and
/// removes applications from the allow-list once their quota is used up.
#[derive(Parser, Debug)]
#[command(name = "app-quota")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the quota engine (foreground changes are read from stdin)
    Run,
    /// Show today's usage, limits and the allow-list
    Status,
    /// Add packages to the allow-list
    Allow {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Remove packages from the allow-list
    Disallow {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Replace the allow-list, with optional per-package limits (PKG or PKG=MINUTES)
    Select {
        #[arg(required = true)]
        entries: Vec<String>,

        /// Lock the selection afterwards
        #[arg(long)]
        lock: bool,
    },
    /// Set a daily limit in minutes
    SetLimit {
        package: String,
        minutes: u32,
    },
    /// Remove the daily limit of a package
    ClearLimit {
        package: String,
    },
    /// Lock the selection
    Lock,
    /// Unlock the selection
    Unlock,
    /// Reconcile against OS usage statistics now
    Reconcile,
}

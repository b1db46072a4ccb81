use anyhow::Result;
use clap::Parser;

use app_quota::config::EngineConfig;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::quota;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config_path = quota::config_path(args.config)?;

    if let Commands::Init { force } = args.command {
        commands::init_logging(args.verbose, "info");
        return quota::init(&config_path, force);
    }

    let config = EngineConfig::load_or_default(&config_path)?;
    commands::init_logging(args.verbose, &config.logging.level);
    tracing::debug!("Using configuration: {}", config_path.display());

    match args.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Run => quota::run(config),
        Commands::Status => quota::status(config),
        Commands::Allow { packages } => quota::allow(config, packages),
        Commands::Disallow { packages } => quota::disallow(config, packages),
        Commands::Select { entries, lock } => quota::select(config, entries, lock),
        Commands::SetLimit { package, minutes } => quota::set_limit(config, package, minutes),
        Commands::ClearLimit { package } => quota::clear_limit(config, package),
        Commands::Lock => quota::set_locked(config, true),
        Commands::Unlock => quota::set_locked(config, false),
        Commands::Reconcile => quota::reconcile(config),
    }
}

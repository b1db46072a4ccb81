//! Platform-specific application control

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

use anyhow::{Context, Result};
use std::process::Command;

/// Close every process belonging to `package_id`
pub fn close_app(package_id: &str) -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::close_app(package_id)
    }

    #[cfg(target_os = "macos")]
    {
        macos::close_app(package_id)
    }

    #[cfg(target_os = "linux")]
    {
        linux::close_app(package_id)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        anyhow::bail!("Unsupported operating system for closing {}", package_id)
    }
}

/// Show a desktop notification
pub fn notify(title: &str, message: &str) -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        windows::notify(title, message)
    }

    #[cfg(target_os = "macos")]
    {
        macos::notify(title, message)
    }

    #[cfg(target_os = "linux")]
    {
        linux::notify(title, message)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        tracing::warn!("Notification: {} - {}", title, message);
        Ok(())
    }
}

/// Run an argv-style command, failing on a non-zero exit status
pub fn run_command(argv: &[String]) -> Result<()> {
    let (program, args) = argv.split_first().context("Empty command")?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    try_command(program, &args)
}

/// Try to execute a command, returning Ok if successful
pub(crate) fn try_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to spawn {}", cmd))?;

    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!("Command failed: {} {:?}", cmd, args)
    }
}

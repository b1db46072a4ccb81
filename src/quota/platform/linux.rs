use anyhow::Result;

use super::try_command;

/// Close an application on Linux
///
/// Package ids are matched against process names, first exactly and then
/// against the full command line.
pub fn close_app(package_id: &str) -> Result<()> {
    // 1. procps pkill by exact process name
    if try_command("pkill", &["-x", package_id]).is_ok() {
        return Ok(());
    }

    // 2. psmisc killall
    if try_command("killall", &["-q", package_id]).is_ok() {
        return Ok(());
    }

    // 3. Flatpak-style ids show up in the command line rather than the name
    if package_id.contains('.') && try_command("pkill", &["-f", package_id]).is_ok() {
        return Ok(());
    }

    anyhow::bail!("No running process found for {}", package_id)
}

/// Desktop notification via notify-send
pub fn notify(title: &str, message: &str) -> Result<()> {
    try_command(
        "notify-send",
        &[title, message, "--urgency=critical", "--icon=dialog-warning"],
    )
}

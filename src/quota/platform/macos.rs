use anyhow::Result;

use super::try_command;

/// Close an application on macOS
///
/// Bundle ids are asked to quit through AppleScript first; anything else is
/// matched by process name.
pub fn close_app(package_id: &str) -> Result<()> {
    if package_id.contains('.') {
        let script = format!("tell application id \"{}\" to quit", package_id.replace('"', ""));
        if try_command("osascript", &["-e", &script]).is_ok() {
            return Ok(());
        }
    }

    if try_command("pkill", &["-x", package_id]).is_ok() {
        return Ok(());
    }

    anyhow::bail!("No running application found for {}", package_id)
}

/// Desktop notification via osascript
pub fn notify(title: &str, message: &str) -> Result<()> {
    let script = format!(
        "display notification \"{}\" with title \"{}\" sound name \"Glass\"",
        message.replace('"', "'"),
        title.replace('"', "'")
    );
    try_command("osascript", &["-e", &script])
}

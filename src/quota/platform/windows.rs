use anyhow::Result;

use super::try_command;

/// Close an application on Windows
pub fn close_app(package_id: &str) -> Result<()> {
    let image = image_name(package_id);
    try_command("taskkill", &["/IM", &image, "/F"])
}

/// Windows has no stock CLI for toasts; the notice goes to the log
pub fn notify(title: &str, message: &str) -> Result<()> {
    tracing::warn!("Notification: {} - {}", title, message);
    Ok(())
}

/// Image name for taskkill, adding `.exe` when no extension is present
fn image_name(package_id: &str) -> String {
    if package_id.to_ascii_lowercase().ends_with(".exe") {
        package_id.to_string()
    } else {
        format!("{}.exe", package_id)
    }
}

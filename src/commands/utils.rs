/// Initialize logging
///
/// `RUST_LOG` wins; otherwise `debug` when verbose, else `level`.
pub fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { level };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Format milliseconds of usage for display
pub fn format_usage(millis: i64) -> String {
    let minutes = millis.max(0) / 60_000;
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h {:02}m", minutes / 60, minutes % 60)
    }
}

/// Print sudo message based on OS
pub fn print_sudo_message() {
    #[cfg(unix)]
    eprintln!(
        "Please run with sudo: sudo {}",
        std::env::args().next().unwrap_or_else(|| "app-quota".to_string())
    );

    #[cfg(windows)]
    eprintln!("Please run this program as Administrator.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_usage() {
        assert_eq!(format_usage(0), "0m");
        assert_eq!(format_usage(59_999), "0m");
        assert_eq!(format_usage(600_000), "10m");
        assert_eq!(format_usage(3_900_000), "1h 05m");
        assert_eq!(format_usage(-5), "0m");
    }
}

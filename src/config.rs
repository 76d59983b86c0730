// # Logging Configuration
//
// Shared by the two binaries: log-level parsing for the `-l` flag and the
// tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

/// Parse the CLI log-level token. Unknown values fall back to INFO.
pub fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => tracing::Level::DEBUG,
        "WARN" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        "TRACE" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// Install the global tracing subscriber for a binary.
pub fn init_tracing(level: tracing::Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG"), tracing::Level::DEBUG);
        assert_eq!(parse_log_level("debug"), tracing::Level::DEBUG);
        assert_eq!(parse_log_level("WARN"), tracing::Level::WARN);
        assert_eq!(parse_log_level("ERROR"), tracing::Level::ERROR);
        assert_eq!(parse_log_level("INFO"), tracing::Level::INFO);
        assert_eq!(parse_log_level("bogus"), tracing::Level::INFO);
    }
}

//! Tracing/logging initialization.
//!
//! - Filter: `RUST_LOG`, else `LOG_LEVEL`, else `info`.
//! - Format: `LOG_FORMAT=json` (default) or `plain`.

use tracing_subscriber::EnvFilter;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Plain,
}

impl LogFormat {
    /// Unknown values fall back to JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("plain" | "text" | "pretty") => Self::Plain,
            _ => Self::Json,
        }
    }
}

/// Filter directive from `RUST_LOG`/`LOG_LEVEL` values.
pub fn filter_directive(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    [rust_log, log_level]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "info".to_string())
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let log_level = std::env::var("LOG_LEVEL").ok();
    let directive = filter_directive(rust_log.as_deref(), log_level.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain => builder.try_init(),
    };
}

// Structured Logging for Depth Sync
// tracing + tracing-subscriber, installed once per process

use tracing::Level;
use tracing_subscriber::EnvFilter;
use std::sync::Once;

use crate::core::config::MonitoringConfig;

static INIT: Once = Once::new();

/// Parse a textual log level, defaulting to INFO
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Setup structured logging for the entire application
pub fn setup_logging(log_level: Option<&str>, json_format: bool) {
    let log_level_str = log_level.unwrap_or("INFO");
    let level = parse_level(log_level_str);

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());

        // Suppress noisy libraries
        for directive in [
            "tokio_tungstenite=warn",
            "tungstenite=warn",
            "hyper=warn",
            "reqwest=warn",
        ] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }

        let result = if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .try_init()
        };

        if result.is_ok() {
            tracing::info!(log_level = %log_level_str, json = json_format, "Logging initialized");
        }
    });
}

pub fn setup_logging_from(config: &MonitoringConfig) {
    setup_logging(Some(&config.log_level), config.json_logs);
}

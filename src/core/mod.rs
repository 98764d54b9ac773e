// Core Module - Foundational types, config, logging, output events

pub mod types;
pub mod config;
pub mod logger;
pub mod events;
pub mod symbols;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    ConfigError, ConfigManager, ConfigSummary, ConnectionConfig, ExchangeConfig, FeedConfig,
    HealthConfig, MonitoringConfig, SyncConfig, ThrottleConfig,
};
pub use logger::{setup_logging, setup_logging_from};
pub use events::{event_channel, EventSink, EventSinkStats, EventStream};
pub use symbols::ProductMap;

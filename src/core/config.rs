// Configuration Management for Depth Sync
// JSON file + environment overlay, validated before the feed starts

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub ws_base_url: String,
    pub rest_base_url: String,
    pub snapshot_limit: u32,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "wss://stream.binance.com:9443/ws".to_string(),
            rest_base_url: "https://api.binance.com/api/v3".to_string(),
            snapshot_limit: 1000,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Buffered deltas allowed while awaiting a snapshot
    pub max_pending_deltas: usize,
    /// Stale-snapshot refetches before the product is restarted
    pub max_snapshot_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending_deltas: 500,
            max_snapshot_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub handshake_timeout_secs: u64,
    /// Delay before a product whose handshake failed subscribes again
    pub errored_retry_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 20,
            errored_retry_secs: 60,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn errored_retry(&self) -> Duration {
        Duration::from_secs(self.errored_retry_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Every n-th subscribe attempt is delayed (0 disables pacing)
    pub pacing_every: u64,
    pub pacing_delay_ms: u64,
    pub rate_limit_cooldown_secs: u64,
    pub initial_retry_delay_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            pacing_every: 3,
            pacing_delay_ms: 10_500,
            rate_limit_cooldown_secs: 30,
            initial_retry_delay_secs: 60,
        }
    }
}

impl ThrottleConfig {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub depth_stale_secs: u64,
    pub trade_stale_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 240,
            interval_secs: 36,
            pong_timeout_secs: 180,
            depth_stale_secs: 300,
            trade_stale_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
        }
    }
}

/// Complete feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Canonical product ids to subscribe
    pub products: Vec<String>,
    /// canonical -> exchange symbol; unmapped products pass through unchanged
    pub product_map: HashMap<String, String>,
    pub exchange: ExchangeConfig,
    pub sync: SyncConfig,
    pub connection: ConnectionConfig,
    pub throttle: ThrottleConfig,
    pub health: HealthConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let mut product_map = HashMap::new();
        product_map.insert("BTC-USDT".to_string(), "BTCUSDT".to_string());
        product_map.insert("ETH-BTC".to_string(), "ETHBTC".to_string());

        Self {
            products: vec!["BTC-USDT".to_string(), "ETH-BTC".to_string()],
            product_map,
            exchange: ExchangeConfig::default(),
            sync: SyncConfig::default(),
            connection: ConnectionConfig::default(),
            throttle: ThrottleConfig::default(),
            health: HealthConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub products: usize,
    pub ws_base_url: String,
    pub rest_base_url: String,
    pub max_pending_deltas: usize,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    config: Arc<RwLock<FeedConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            config: Arc::new(RwLock::new(FeedConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    pub fn from_config(config: FeedConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Load configuration from JSON file
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found, using defaults");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config: FeedConfig = serde_json::from_str(&content)?;
        *self.config.write() = config;

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Environment overrides for deployment-specific values
    pub fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = self.config.write();

        if let Some(products) = lookup("FEED_PRODUCTS") {
            let products: Vec<String> = products
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if !products.is_empty() {
                config.products = products;
            }
        }
        if let Some(url) = lookup("FEED_WS_URL") {
            config.exchange.ws_base_url = url;
        }
        if let Some(url) = lookup("FEED_REST_URL") {
            config.exchange.rest_base_url = url;
        }
        if let Some(level) = lookup("FEED_LOG_LEVEL") {
            config.monitoring.log_level = level;
        }
    }

    /// Save configuration to JSON file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&*self.config.read())?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration, returning every violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        let config = self.config.read();
        let mut errors = Vec::new();

        if config.products.is_empty() {
            errors.push("at least one product is required".to_string());
        }
        if !config.exchange.ws_base_url.starts_with("ws://")
            && !config.exchange.ws_base_url.starts_with("wss://")
        {
            errors.push(format!("ws_base_url must be a ws(s) URL: {}", config.exchange.ws_base_url));
        }
        if !config.exchange.rest_base_url.starts_with("http://")
            && !config.exchange.rest_base_url.starts_with("https://")
        {
            errors.push(format!("rest_base_url must be an http(s) URL: {}", config.exchange.rest_base_url));
        }
        if config.exchange.snapshot_limit == 0 {
            errors.push("snapshot_limit must be positive".to_string());
        }
        if config.sync.max_pending_deltas == 0 {
            errors.push("max_pending_deltas must be positive".to_string());
        }
        if config.connection.handshake_timeout_secs == 0 {
            errors.push("handshake_timeout_secs must be positive".to_string());
        }
        if config.connection.errored_retry_secs == 0 {
            errors.push("errored_retry_secs must be positive".to_string());
        }
        if config.health.interval_secs == 0 {
            errors.push("health interval_secs must be positive".to_string());
        }
        if config.health.depth_stale_secs == 0 || config.health.trade_stale_secs == 0 {
            errors.push("stale thresholds must be positive".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Err(ConfigError::Validation(errors.join("; ")));
        }

        info!("Configuration validated successfully");
        Ok(())
    }

    pub fn get_summary(&self) -> ConfigSummary {
        let config = self.config.read();
        ConfigSummary {
            products: config.products.len(),
            ws_base_url: config.exchange.ws_base_url.clone(),
            rest_base_url: config.exchange.rest_base_url.clone(),
            max_pending_deltas: config.sync.max_pending_deltas,
            log_level: config.monitoring.log_level.clone(),
        }
    }

    pub fn config(&self) -> FeedConfig {
        self.config.read().clone()
    }
}

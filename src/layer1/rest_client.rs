// REST Client for Binance Spot API - market data only
// Depth snapshot fetch with typed ban / rate-limit classification

use parking_lot::RwLock;
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::config::ExchangeConfig;
use crate::layer2::parser::{parse_depth_snapshot, DepthSnapshot, ParseError};

/// Body pattern of an HTTP 418 answer, e.g. "IP banned until 1700000005000."
const BANNED_UNTIL_PATTERN: &str = r"banned until (\d+)";

// ============================================================================
// Error Types
// ============================================================================

/// Structured outcome of a failed snapshot request
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IP banned until {until_ms:?}")]
    Banned { until_ms: Option<u64> },
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("HTTP status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Snapshot decode error: {0}")]
    Decode(#[from] ParseError),
}

impl SnapshotError {
    /// Ban and rate-limit failures are handled by the ban controller
    pub fn is_throttle(&self) -> bool {
        matches!(self, SnapshotError::Banned { .. } | SnapshotError::RateLimited { .. })
    }
}

#[derive(Debug, Error)]
pub enum RestClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Operation not supported by a market-data client: {0}")]
    Unsupported(&'static str),
}

// ============================================================================
// Snapshot Source seam
// ============================================================================

/// Anything able to produce a depth snapshot for an exchange symbol
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch_snapshot(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<DepthSnapshot, SnapshotError>> + Send;
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub bans: u64,
    pub rate_limits: u64,
    pub other_failures: u64,
}

impl RestClientStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent > 0 {
            self.requests_succeeded as f64 / self.requests_sent as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, bans={}, rate_limits={}, other={}, rate={:.2}%)",
            self.requests_sent,
            self.requests_succeeded,
            self.bans,
            self.rate_limits,
            self.other_failures,
            self.success_rate() * 100.0
        )
    }
}

// ============================================================================
// Snapshot Fetcher
// ============================================================================

/// One-shot depth snapshot requests against `GET {base}/depth`
pub struct SnapshotFetcher {
    base_url: String,
    limit: u32,
    client: Client,
    ban_pattern: Regex,
    stats: Arc<RwLock<RestClientStats>>,
}

impl SnapshotFetcher {
    pub fn new(base_url: &str, limit: u32, timeout_secs: u64) -> Result<Self, RestClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            limit,
            client,
            ban_pattern: Regex::new(BANNED_UNTIL_PATTERN)?,
            stats: Arc::new(RwLock::new(RestClientStats::default())),
        })
    }

    pub fn from_config(config: &ExchangeConfig) -> Result<Self, RestClientError> {
        Self::new(&config.rest_base_url, config.snapshot_limit, config.request_timeout_secs)
    }

    pub fn snapshot_url(&self, symbol: &str) -> String {
        format!(
            "{}/depth?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            self.limit
        )
    }

    /// Fetch and decode a full depth snapshot
    pub async fn fetch(&self, symbol: &str) -> Result<DepthSnapshot, SnapshotError> {
        let url = self.snapshot_url(symbol);
        debug!(url = %url, "Requesting depth snapshot");
        self.stats.write().requests_sent += 1;

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                self.stats.write().other_failures += 1;
                return Err(SnapshotError::Http(e));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if !status.is_success() {
            let error = self.classify_failure(status, &headers, &body);
            let mut stats = self.stats.write();
            match &error {
                SnapshotError::Banned { .. } => stats.bans += 1,
                SnapshotError::RateLimited { .. } => stats.rate_limits += 1,
                _ => stats.other_failures += 1,
            }
            warn!(symbol = symbol, status = status.as_u16(), error = %error, "Snapshot request failed");
            return Err(error);
        }

        let snapshot = parse_depth_snapshot(&body)?;
        self.stats.write().requests_succeeded += 1;
        info!(
            symbol = symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Depth snapshot received"
        );
        Ok(snapshot)
    }

    /// Map a non-2xx response onto the structured error contract
    pub fn classify_failure(&self, status: StatusCode, headers: &HeaderMap, body: &str) -> SnapshotError {
        match status.as_u16() {
            418 => SnapshotError::Banned {
                until_ms: self
                    .ban_pattern
                    .captures(body)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<u64>().ok()),
            },
            429 => SnapshotError::RateLimited {
                retry_after: headers
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs),
            },
            code => SnapshotError::Status {
                code,
                body: body.chars().take(256).collect(),
            },
        }
    }

    pub fn get_stats(&self) -> RestClientStats {
        self.stats.read().clone()
    }
}

impl SnapshotSource for SnapshotFetcher {
    fn fetch_snapshot(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<DepthSnapshot, SnapshotError>> + Send {
        self.fetch(symbol)
    }
}

// ============================================================================
// Trading surface (not provided by a market-data feed)
// ============================================================================

/// Account/trading operations of the exchange adapter. This feed only
/// carries market data, so every call fails immediately.
pub struct BinanceRestClient;

impl BinanceRestClient {
    pub async fn place_order(&self, _symbol: &str, _side: &str, _quantity: f64, _price: Option<f64>) -> Result<(), RestClientError> {
        Err(RestClientError::Unsupported("place_order"))
    }

    pub async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), RestClientError> {
        Err(RestClientError::Unsupported("cancel_order"))
    }

    pub async fn cancel_all_orders(&self, _symbol: &str) -> Result<(), RestClientError> {
        Err(RestClientError::Unsupported("cancel_all_orders"))
    }

    pub async fn load_balances(&self) -> Result<(), RestClientError> {
        Err(RestClientError::Unsupported("load_balances"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SNAPSHOT_BODY: &str = r#"{"lastUpdateId":1027024,"bids":[["4.00000000","431.00000000"]],"asks":[["4.00000200","12.00000000"]]}"#;

    fn fetcher(base: &str) -> SnapshotFetcher {
        SnapshotFetcher::new(base, 1000, 5).unwrap()
    }

    #[test]
    fn test_snapshot_url() {
        let f = fetcher("https://api.binance.com/api/v3/");
        assert_eq!(
            f.snapshot_url("btcusdt"),
            "https://api.binance.com/api/v3/depth?symbol=BTCUSDT&limit=1000"
        );
    }

    #[test]
    fn test_classify_ban_with_timestamp() {
        let f = fetcher("http://localhost");
        let body = r#"{"code":-1003,"msg":"Way too many requests; IP banned until 1700000005000. Please use the websocket for live updates to avoid bans."}"#;
        match f.classify_failure(StatusCode::IM_A_TEAPOT, &HeaderMap::new(), body) {
            SnapshotError::Banned { until_ms } => assert_eq!(until_ms, Some(1_700_000_005_000)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_ban_without_timestamp() {
        let f = fetcher("http://localhost");
        match f.classify_failure(StatusCode::IM_A_TEAPOT, &HeaderMap::new(), "banned") {
            SnapshotError::Banned { until_ms } => assert_eq!(until_ms, None),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_other_status() {
        let f = fetcher("http://localhost");
        let error = f.classify_failure(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new(), "oops");
        assert!(matches!(error, SnapshotError::Status { code: 500, .. }));
        assert!(!error.is_throttle());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/depth"))
            .and(query_param("symbol", "BNBBTC"))
            .and(query_param("limit", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SNAPSHOT_BODY))
            .mount(&server)
            .await;

        let f = fetcher(&server.uri());
        let snapshot = f.fetch("bnbbtc").await.unwrap();
        assert_eq!(snapshot.last_update_id, 1027024);
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(f.get_stats().requests_succeeded, 1);
    }

    #[tokio::test]
    async fn test_fetch_banned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/depth"))
            .respond_with(
                ResponseTemplate::new(418)
                    .set_body_string(r#"{"code":-1003,"msg":"IP banned until 1700000005000."}"#),
            )
            .mount(&server)
            .await;

        let f = fetcher(&server.uri());
        let error = f.fetch("BTCUSDT").await.unwrap_err();
        assert!(matches!(error, SnapshotError::Banned { until_ms: Some(1_700_000_005_000) }));
        assert!(error.is_throttle());
        assert_eq!(f.get_stats().bans, 1);
    }

    #[tokio::test]
    async fn test_fetch_rate_limited_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/depth"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let f = fetcher(&server.uri());
        match f.fetch("BTCUSDT").await {
            Err(SnapshotError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.get_stats().rate_limits, 1);
    }

    #[tokio::test]
    async fn test_fetch_bad_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/depth"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"nope\":1}"))
            .mount(&server)
            .await;

        let f = fetcher(&server.uri());
        assert!(matches!(f.fetch("BTCUSDT").await, Err(SnapshotError::Decode(_))));
    }

    #[tokio::test]
    async fn test_trading_operations_unsupported() {
        let client = BinanceRestClient;
        assert!(matches!(
            client.place_order("BTCUSDT", "buy", 1.0, None).await,
            Err(RestClientError::Unsupported("place_order"))
        ));
        assert!(matches!(
            client.cancel_all_orders("BTCUSDT").await,
            Err(RestClientError::Unsupported("cancel_all_orders"))
        ));
        assert!(matches!(
            client.load_balances().await,
            Err(RestClientError::Unsupported("load_balances"))
        ));
    }
}

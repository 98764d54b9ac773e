// Message Parser - Binance depth/trade frames and REST depth snapshots
// Raw exchange JSON -> typed updates consumed by the synchronizer

use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::core::types::PriceLevel;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Invalid {field}: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("Unexpected event type: {0}")]
    UnexpectedEventType(String),
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Parse a string field as f64
fn parse_f64_field(value: &str, field: &'static str) -> Result<f64, ParseError> {
    value.parse::<f64>().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Parse a Binance [price_string, qty_string] pair into PriceLevel
fn parse_level(raw: &[String; 2]) -> Result<PriceLevel, ParseError> {
    Ok(PriceLevel {
        price: parse_f64_field(&raw[0], "price")?,
        size: parse_f64_field(&raw[1], "quantity")?,
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, ParseError> {
    raw.iter().map(parse_level).collect()
}

// ============================================================================
// Parsed Message Types
// ============================================================================

/// Incremental book update covering update ids `first_update_id..=final_update_id`
#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    pub symbol: String,
    pub event_time: u64,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl fmt::Display for DepthUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DepthUpdate({} U={} u={} bids={} asks={})",
            self.symbol,
            self.first_update_id,
            self.final_update_id,
            self.bids.len(),
            self.asks.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    pub symbol: String,
    pub event_time: u64,
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub trade_time: u64,
    pub is_buyer_maker: bool,
}

/// REST depth snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

// ============================================================================
// Serde Structures (Raw Binance JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: u64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

// ============================================================================
// Stateless decoders
// ============================================================================

pub fn parse_depth_update(raw_json: &str) -> Result<DepthUpdate, ParseError> {
    let raw: RawDepthUpdate = serde_json::from_str(raw_json)?;
    if raw.event_type != "depthUpdate" {
        return Err(ParseError::UnexpectedEventType(raw.event_type));
    }
    if raw.first_update_id > raw.final_update_id {
        return Err(ParseError::ValidationFailed(format!(
            "first update id {} after final update id {}",
            raw.first_update_id, raw.final_update_id
        )));
    }

    Ok(DepthUpdate {
        symbol: raw.symbol,
        event_time: raw.event_time,
        first_update_id: raw.first_update_id,
        final_update_id: raw.final_update_id,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

pub fn parse_trade(raw_json: &str) -> Result<TradeUpdate, ParseError> {
    let raw: RawTrade = serde_json::from_str(raw_json)?;
    if raw.event_type != "trade" {
        return Err(ParseError::UnexpectedEventType(raw.event_type));
    }

    Ok(TradeUpdate {
        symbol: raw.symbol,
        event_time: raw.event_time,
        trade_id: raw.trade_id,
        price: parse_f64_field(&raw.price, "price")?,
        quantity: parse_f64_field(&raw.quantity, "quantity")?,
        trade_time: raw.trade_time,
        is_buyer_maker: raw.is_buyer_maker,
    })
}

pub fn parse_depth_snapshot(raw_json: &str) -> Result<DepthSnapshot, ParseError> {
    let raw: RawDepthSnapshot = serde_json::from_str(raw_json)?;
    Ok(DepthSnapshot {
        last_update_id: raw.last_update_id,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

// ============================================================================
// MessageParser - per-product parser with symbol validation & stats
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub depth_count: u64,
    pub trade_count: u64,
    pub parse_errors: u64,
    pub validation_failures: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.depth_count + self.trade_count + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

pub struct MessageParser {
    pub symbol: String,
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            stats: ParserStats::default(),
        }
    }

    fn check_symbol(&mut self, symbol: &str) -> Result<(), ParseError> {
        if symbol.to_uppercase() != self.symbol {
            self.stats.validation_failures += 1;
            return Err(ParseError::ValidationFailed(format!(
                "Symbol mismatch: expected {}, got {}",
                self.symbol, symbol
            )));
        }
        Ok(())
    }

    pub fn parse_depth(&mut self, raw_json: &str) -> Result<DepthUpdate, ParseError> {
        let update = match parse_depth_update(raw_json) {
            Ok(u) => u,
            Err(e) => {
                debug!(error = %e, "Depth frame rejected");
                self.stats.parse_errors += 1;
                return Err(e);
            }
        };
        self.check_symbol(&update.symbol)?;
        self.stats.depth_count += 1;
        Ok(update)
    }

    pub fn parse_trade(&mut self, raw_json: &str) -> Result<TradeUpdate, ParseError> {
        let trade = match parse_trade(raw_json) {
            Ok(t) => t,
            Err(e) => {
                self.stats.parse_errors += 1;
                return Err(e);
            }
        };
        self.check_symbol(&trade.symbol)?;
        self.stats.trade_count += 1;
        Ok(trade)
    }
}

// Core Type Definitions for Depth Sync
// Normalized output events and socket bookkeeping enums

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Trade aggressor side from the exchange maker flag.
    /// Buyer is maker => the taker sold.
    pub fn from_buyer_maker(is_buyer_maker: bool) -> Self {
        if is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" | "bid" => Ok(Side::Buy),
            "sell" | "ask" => Ok(Side::Sell),
            _ => Err(format!("Invalid Side: '{}'. Expected 'buy' or 'sell'", s)),
        }
    }
}

/// Which of the two per-product streams a socket carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketKind {
    Depth,
    Trade,
}

impl SocketKind {
    pub fn stream_suffix(&self) -> &'static str {
        match self {
            SocketKind::Depth => "depth",
            SocketKind::Trade => "trade",
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stream_suffix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SocketState {
    pub fn is_closed_or_closing(&self) -> bool {
        matches!(self, SocketState::Closing | SocketState::Closed)
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Price Level
// ============================================================================

/// A price level [price, size]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

// ============================================================================
// Normalized Events (downstream contract)
// ============================================================================

/// Full book state at a known exchange update id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub product: String,
    pub time: u64,
    pub sequence: u64,
    pub source_sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// One changed price level. `size == 0` removes the level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelEvent {
    pub product: String,
    pub time: u64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub sequence: u64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub product: String,
    pub time: u64,
    pub trade_id: String,
    pub price: f64,
    pub size: f64,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NormalizedEvent {
    Snapshot(SnapshotEvent),
    Level(LevelEvent),
    Trade(TradeEvent),
}

impl NormalizedEvent {
    pub fn product(&self) -> &str {
        match self {
            NormalizedEvent::Snapshot(s) => &s.product,
            NormalizedEvent::Level(l) => &l.product,
            NormalizedEvent::Trade(t) => &t.product,
        }
    }

    /// Feed sequence for book events; trades are unsequenced
    pub fn sequence(&self) -> Option<u64> {
        match self {
            NormalizedEvent::Snapshot(s) => Some(s.sequence),
            NormalizedEvent::Level(l) => Some(l.sequence),
            NormalizedEvent::Trade(_) => None,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, NormalizedEvent::Snapshot(_))
    }
}

impl fmt::Display for NormalizedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizedEvent::Snapshot(s) => write!(
                f,
                "Snapshot(product={}, source_seq={}, bids={}, asks={})",
                s.product, s.source_sequence, s.bids.len(), s.asks.len()
            ),
            NormalizedEvent::Level(l) => write!(
                f,
                "Level(product={}, seq={}, {} {}@{})",
                l.product, l.sequence, l.side, l.size, l.price
            ),
            NormalizedEvent::Trade(t) => write!(
                f,
                "Trade(product={}, id={}, {} {}@{})",
                t.product, t.trade_id, t.side, t.size, t.price
            ),
        }
    }
}

// ============================================================================
// Time
// ============================================================================

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

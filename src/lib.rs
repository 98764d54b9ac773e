// Depth Sync - gap-free order book feed reconstruction for Binance spot
//
// core   : types, configuration, logging, output events, symbol mapping
// layer1 : exchange connectors (sockets, REST snapshots, ban control)
// layer2 : synchronization, health monitoring, per-product workers, feed facade

pub mod core;
pub mod layer1;
pub mod layer2;

pub use crate::core::{event_channel, ConfigManager, EventStream, FeedConfig, NormalizedEvent};
pub use crate::layer2::{DepthFeed, FeedError};

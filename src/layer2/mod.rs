// Layer 2 - Data Processing & Synchronization
// Frame decoding, snapshot/delta reconciliation, per-product workers and the feed facade

pub mod parser;
pub mod synchronizer;
pub mod health;
pub mod worker;
pub mod feed;

// Re-export commonly used items
pub use parser::{
    parse_depth_snapshot, parse_depth_update, parse_trade, DepthSnapshot, DepthUpdate,
    MessageParser, ParseError, ParserStats, TradeUpdate,
};
pub use synchronizer::{
    DataSynchronizer, DepthOutcome, RestartReason, SnapshotOutcome, SyncState,
    SynchronizerStats, AWAITING_SNAPSHOT,
};
pub use health::{evaluate, run_health_monitor, HealthFailure};
pub use worker::{
    spawn_worker, ProductEvent, ProductWorker, WorkerContext, WorkerInbox, WorkerRegistry,
    WorkerStats,
};
pub use feed::{DepthFeed, FeedError, FeedStats};

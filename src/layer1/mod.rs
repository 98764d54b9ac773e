// Layer 1 - Exchange connectors for the Binance spot market-data feed

pub mod websocket;
pub mod connection;
pub mod rest_client;
pub mod ban_controller;

// Re-export commonly used items for convenience
pub use websocket::{stream_url, TungsteniteConnector};
pub use connection::{
    ConnectionPair, SocketCommand, SocketEvent, SocketHandle, SocketMessage, StreamConnector,
};
pub use rest_client::{
    BinanceRestClient, RestClientError, RestClientStats, SnapshotError, SnapshotFetcher,
    SnapshotSource,
};
pub use ban_controller::{BanController, BanControllerStats, BanWindow, RetrySweep, SweepReason};

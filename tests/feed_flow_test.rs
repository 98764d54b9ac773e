// End-to-End Flow Tests for Depth Sync
//
// These tests drive the full feed without network connections:
//   DepthFeed → ProductWorker → (fake sockets, fake REST snapshots) → EventStream
//
// Run with: cargo test --test feed_flow_test

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use depth_sync::core::{now_millis, FeedConfig, NormalizedEvent, Side, SocketKind, ThrottleConfig};
use depth_sync::layer1::{
    SnapshotError, SnapshotSource, SocketCommand, SocketEvent, SocketHandle, SocketMessage,
    StreamConnector,
};
use depth_sync::layer2::DepthSnapshot;
use depth_sync::core::PriceLevel;
use depth_sync::{DepthFeed, EventStream};

// ============================================================================
// Fakes
// ============================================================================

struct OpenedSocket {
    url: String,
    kind: SocketKind,
    generation: u64,
    events: mpsc::UnboundedSender<SocketMessage>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
}

#[derive(Clone, Default)]
struct FakeConnector {
    opened: Arc<Mutex<Vec<OpenedSocket>>>,
}

impl StreamConnector for FakeConnector {
    fn open(
        &self,
        url: &str,
        kind: SocketKind,
        generation: u64,
        events: mpsc::UnboundedSender<SocketMessage>,
    ) -> SocketHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.opened.lock().push(OpenedSocket {
            url: url.to_string(),
            kind,
            generation,
            events,
            commands: rx,
        });
        SocketHandle::new(kind, generation, tx)
    }
}

impl FakeConnector {
    fn count_for(&self, stream: &str) -> usize {
        self.opened.lock().iter().filter(|s| s.url.contains(stream)).count()
    }

    fn latest_generation(&self, stream: &str) -> Option<u64> {
        self.opened
            .lock()
            .iter()
            .filter(|s| s.url.contains(stream))
            .map(|s| s.generation)
            .max()
    }

    /// Deliver an event as if the socket for `stream` (latest generation) produced it
    fn emit(&self, stream: &str, kind: SocketKind, event: SocketEvent) {
        let opened = self.opened.lock();
        let socket = opened
            .iter()
            .rev()
            .find(|s| s.url.contains(stream) && s.kind == kind)
            .expect("socket opened");
        socket
            .events
            .send(SocketMessage { generation: socket.generation, kind, event })
            .unwrap();
    }

    /// Deliver an event tagged with an explicit generation
    fn emit_for_generation(&self, stream: &str, kind: SocketKind, generation: u64, event: SocketEvent) {
        let opened = self.opened.lock();
        let socket = opened
            .iter()
            .find(|s| s.url.contains(stream) && s.kind == kind && s.generation == generation)
            .expect("socket opened");
        socket
            .events
            .send(SocketMessage { generation, kind, event })
            .unwrap();
    }

    fn commands_for(&self, stream: &str, kind: SocketKind, generation: u64) -> Vec<SocketCommand> {
        let mut opened = self.opened.lock();
        let socket = opened
            .iter_mut()
            .find(|s| s.url.contains(stream) && s.kind == kind && s.generation == generation)
            .expect("socket opened");
        let mut commands = Vec::new();
        while let Ok(cmd) = socket.commands.try_recv() {
            commands.push(cmd);
        }
        commands
    }
}

#[derive(Clone, Default)]
struct FakeSnapshots {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<DepthSnapshot, SnapshotError>>>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeSnapshots {
    fn push(&self, symbol: &str, response: Result<DepthSnapshot, SnapshotError>) {
        self.responses
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push_back(response);
    }

    fn request_count(&self, symbol: &str) -> usize {
        self.requests.lock().iter().filter(|s| s.as_str() == symbol).count()
    }
}

impl SnapshotSource for FakeSnapshots {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<DepthSnapshot, SnapshotError> {
        self.requests.lock().push(symbol.to_string());
        let next = self
            .responses
            .lock()
            .get_mut(symbol)
            .and_then(|q| q.pop_front());
        next.unwrap_or(Err(SnapshotError::Status { code: 503, body: "no snapshot".to_string() }))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(products: &[&str]) -> FeedConfig {
    let mut config = FeedConfig::default();
    config.products = products.iter().map(|p| p.to_string()).collect();
    config.throttle = ThrottleConfig {
        pacing_every: 0,
        ..ThrottleConfig::default()
    };
    config
}

fn snapshot(last_update_id: u64) -> DepthSnapshot {
    DepthSnapshot {
        last_update_id,
        bids: vec![PriceLevel::new(99.0, 1.0)],
        asks: vec![PriceLevel::new(101.0, 1.0)],
    }
}

fn depth_json(symbol: &str, first: u64, last: u64) -> String {
    format!(
        r#"{{"e":"depthUpdate","E":{ts},"s":"{symbol}","U":{first},"u":{last},"b":[["{last}.0","1.5"]],"a":[]}}"#,
        ts = 1_700_000_000_000u64 + last,
        symbol = symbol,
        first = first,
        last = last,
    )
}

fn trade_json(symbol: &str, trade_id: u64, is_buyer_maker: bool) -> String {
    format!(
        r#"{{"e":"trade","E":1700000000999,"s":"{symbol}","t":{trade_id},"p":"100.5","q":"0.25","b":1,"a":2,"T":1700000000998,"m":{maker},"M":true}}"#,
        symbol = symbol,
        trade_id = trade_id,
        maker = is_buyer_maker,
    )
}

/// Let spawned tasks make progress until `cond` holds
async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn next_events(stream: &mut EventStream, count: usize) -> Vec<NormalizedEvent> {
    let mut events = Vec::new();
    while events.len() < count {
        match tokio::time::timeout(Duration::from_secs(1), stream.recv()).await {
            Ok(Some(event)) => events.push(event),
            _ => break,
        }
    }
    events
}

/// Open both sockets and answer their pings
async fn connect(connector: &FakeConnector, stream: &str) {
    wait_until(|| connector.count_for(stream) >= 2).await;
    connector.emit(stream, SocketKind::Depth, SocketEvent::Opened);
    connector.emit(stream, SocketKind::Trade, SocketEvent::Opened);
    connector.emit(stream, SocketKind::Depth, SocketEvent::Pong);
    connector.emit(stream, SocketKind::Trade, SocketEvent::Pong);
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_buffered_deltas_reconciled_with_snapshot() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();
    snapshots.push("BTCUSDT", Ok(snapshot(100)));

    let (feed, mut events) = DepthFeed::start_with(config(&["BTC-USDT"]), connector.clone(), snapshots.clone());
    wait_until(|| connector.count_for("btcusdt@") >= 2).await;

    // Deltas arrive before the snapshot
    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Frame(depth_json("BTCUSDT", 95, 101)));
    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Frame(depth_json("BTCUSDT", 102, 105)));
    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Frame(depth_json("BTCUSDT", 90, 95)));
    connect(&connector, "btcusdt@").await;

    let received = next_events(&mut events, 3).await;
    assert_eq!(received.len(), 3);
    match &received[0] {
        NormalizedEvent::Snapshot(s) => {
            assert_eq!(s.product, "BTC-USDT");
            assert_eq!(s.source_sequence, 100);
            assert_eq!(s.sequence, 0);
        }
        other => panic!("expected snapshot, got {}", other),
    }
    let prices: Vec<f64> = received[1..]
        .iter()
        .map(|e| match e {
            NormalizedEvent::Level(l) => l.price,
            other => panic!("expected level, got {}", other),
        })
        .collect();
    assert_eq!(prices, vec![101.0, 105.0]);
    assert_eq!(received[1].sequence(), Some(1));
    assert_eq!(received[2].sequence(), Some(2));

    // Live delta continues the sequence
    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Frame(depth_json("BTCUSDT", 106, 108)));
    let live = next_events(&mut events, 1).await;
    assert_eq!(live[0].sequence(), Some(3));

    // The pair was pinged on open
    assert!(connector
        .commands_for("btcusdt@depth", SocketKind::Depth, 1)
        .contains(&SocketCommand::Ping));

    let stats = feed.shutdown().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].sync.deltas_applied, 3);
    assert_eq!(stats[0].sync.deltas_discarded, 1);
    assert_eq!(stats[0].sync.restarts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_trades_forwarded_immediately() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();

    let (feed, mut events) = DepthFeed::start_with(config(&["ETH-BTC"]), connector.clone(), snapshots);
    wait_until(|| connector.count_for("ethbtc@") >= 2).await;

    // No snapshot yet, trades still flow
    connector.emit("ethbtc@", SocketKind::Trade, SocketEvent::Frame(trade_json("ETHBTC", 42, true)));
    connector.emit("ethbtc@", SocketKind::Trade, SocketEvent::Frame(trade_json("ETHBTC", 43, false)));

    let received = next_events(&mut events, 2).await;
    match (&received[0], &received[1]) {
        (NormalizedEvent::Trade(a), NormalizedEvent::Trade(b)) => {
            assert_eq!(a.product, "ETH-BTC");
            assert_eq!(a.trade_id, "42");
            assert_eq!(a.side, Side::Sell);
            assert_eq!(a.price, 100.5);
            assert_eq!(a.size, 0.25);
            assert_eq!(a.time, 1_700_000_000_999);
            assert_eq!(b.side, Side::Buy);
        }
        other => panic!("expected trades, got {:?}", other),
    }

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_live_gap_resubscribes_only_that_product() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();
    snapshots.push("BTCUSDT", Ok(snapshot(100)));
    snapshots.push("ETHBTC", Ok(snapshot(500)));

    let (feed, mut events) = DepthFeed::start_with(
        config(&["BTC-USDT", "ETH-BTC"]),
        connector.clone(),
        snapshots.clone(),
    );
    connect(&connector, "btcusdt@").await;
    connect(&connector, "ethbtc@").await;
    let _ = next_events(&mut events, 2).await;

    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Frame(depth_json("BTCUSDT", 101, 102)));
    // 103 is missing
    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Frame(depth_json("BTCUSDT", 104, 110)));

    wait_until(|| connector.latest_generation("btcusdt@") == Some(2)).await;
    assert_eq!(connector.latest_generation("ethbtc@"), Some(1));

    // Old pair was closed deliberately; its close event is ignored
    assert!(connector
        .commands_for("btcusdt@depth", SocketKind::Depth, 1)
        .contains(&SocketCommand::Close));
    connector.emit_for_generation("btcusdt@", SocketKind::Depth, 1, SocketEvent::Closed(None));
    connector.emit_for_generation("btcusdt@", SocketKind::Trade, 1, SocketEvent::Error("reset".into()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.latest_generation("btcusdt@"), Some(2));

    let stats = feed.shutdown().await;
    let btc = stats.iter().find(|s| s.product == "BTC-USDT").unwrap();
    assert_eq!(btc.sync.restarts, 1);
    assert!(btc.stale_events >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_active_socket_close_resubscribes() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();
    snapshots.push("BTCUSDT", Ok(snapshot(100)));

    let (feed, _events) = DepthFeed::start_with(config(&["BTC-USDT"]), connector.clone(), snapshots);
    connect(&connector, "btcusdt@").await;

    connector.emit("btcusdt@", SocketKind::Trade, SocketEvent::Closed(Some("1006".into())));
    wait_until(|| connector.latest_generation("btcusdt@") == Some(2)).await;

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ban_blocks_subscribes_and_sweeps_once() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();
    let until = now_millis() + 5_000;
    snapshots.push("BTCUSDT", Err(SnapshotError::Banned { until_ms: Some(until) }));
    snapshots.push("BTCUSDT", Ok(snapshot(100)));

    let (feed, mut events) = DepthFeed::start_with(config(&["BTC-USDT", "ETH-BTC"]), connector.clone(), snapshots.clone());
    connect(&connector, "btcusdt@").await;

    wait_until(|| feed.is_banned()).await;
    assert_eq!(feed.errored_products(), vec!["BTC-USDT".to_string()]);

    // Concurrent resubscribe attempts are rejected while banned
    feed.subscribe("ETH-BTC").unwrap();
    wait_until(|| feed.errored_products().len() == 2).await;
    assert_eq!(connector.latest_generation("ethbtc@"), Some(1));

    // After the ban ends, both products are retried exactly once
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!feed.is_banned());
    wait_until(|| connector.latest_generation("btcusdt@") == Some(2)).await;
    wait_until(|| connector.latest_generation("ethbtc@") == Some(2)).await;

    connect(&connector, "btcusdt@").await;
    let received = next_events(&mut events, 1).await;
    assert!(received[0].is_snapshot());
    assert_eq!(snapshots.request_count("BTCUSDT"), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.latest_generation("btcusdt@"), Some(2));
    assert_eq!(connector.latest_generation("ethbtc@"), Some(2));
    assert_eq!(feed.get_stats().ban.sweeps, 1);

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_snapshot_is_refetched() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();
    snapshots.push("BTCUSDT", Ok(snapshot(100)));
    snapshots.push("BTCUSDT", Ok(snapshot(130)));

    let (feed, mut events) = DepthFeed::start_with(config(&["BTC-USDT"]), connector.clone(), snapshots.clone());
    wait_until(|| connector.count_for("btcusdt@") >= 2).await;
    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Frame(depth_json("BTCUSDT", 120, 135)));
    connect(&connector, "btcusdt@").await;

    let received = next_events(&mut events, 2).await;
    match &received[0] {
        NormalizedEvent::Snapshot(s) => assert_eq!(s.source_sequence, 130),
        other => panic!("expected snapshot, got {}", other),
    }
    assert!(matches!(&received[1], NormalizedEvent::Level(l) if l.price == 135.0));
    assert_eq!(snapshots.request_count("BTCUSDT"), 2);

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_closes_pair() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();

    let (feed, _events) = DepthFeed::start_with(config(&["BTC-USDT"]), connector.clone(), snapshots);
    wait_until(|| connector.count_for("btcusdt@") >= 2).await;

    feed.unsubscribe("BTC-USDT").unwrap();
    assert!(feed.products().is_empty());
    assert!(feed.subscribe("BTC-USDT").is_err());

    wait_until(|| {
        connector
            .commands_for("btcusdt@trade", SocketKind::Trade, 1)
            .contains(&SocketCommand::Close)
    })
    .await;

    feed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_handshake_error_after_startup_is_retried() {
    let connector = FakeConnector::default();
    let snapshots = FakeSnapshots::default();
    snapshots.push("BTCUSDT", Ok(snapshot(100)));
    snapshots.push("BTCUSDT", Ok(snapshot(200)));

    let (feed, mut events) = DepthFeed::start_with(config(&["BTC-USDT"]), connector.clone(), snapshots.clone());
    connect(&connector, "btcusdt@").await;
    assert!(next_events(&mut events, 1).await[0].is_snapshot());

    // Past the start-up sweep, so only the worker itself can bring it back
    tokio::time::sleep(Duration::from_secs(120)).await;

    connector.emit("btcusdt@", SocketKind::Depth, SocketEvent::Closed(Some("1006".into())));
    wait_until(|| connector.latest_generation("btcusdt@") == Some(2)).await;
    connector.emit_for_generation("btcusdt@", SocketKind::Trade, 2, SocketEvent::Error("dns failure".into()));
    wait_until(|| feed.errored_products() == vec!["BTC-USDT".to_string()]).await;

    let retry = config(&[]).connection.errored_retry_secs;
    tokio::time::sleep(Duration::from_secs(retry + 1)).await;
    assert_eq!(connector.latest_generation("btcusdt@"), Some(3));

    connect(&connector, "btcusdt@").await;
    let received = next_events(&mut events, 1).await;
    match &received[0] {
        NormalizedEvent::Snapshot(s) => assert_eq!(s.source_sequence, 200),
        other => panic!("expected snapshot, got {}", other),
    }
    assert!(feed.errored_products().is_empty());

    let stats = feed.shutdown().await;
    assert_eq!(stats[0].errored_retries, 1);
}

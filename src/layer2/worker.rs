// Product Worker - single-owner task per product
// Owns the connection pair, the parser and the synchronizer; every socket
// callback, timer and snapshot result arrives as a typed ProductEvent.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::config::FeedConfig;
use crate::core::events::EventSink;
use crate::core::types::{now_millis, NormalizedEvent, Side, SocketKind, SocketState, TradeEvent};
use crate::layer1::ban_controller::BanController;
use crate::layer1::connection::{ConnectionPair, SocketEvent, SocketMessage, StreamConnector};
use crate::layer1::rest_client::{SnapshotError, SnapshotSource};
use crate::layer1::websocket::stream_url;
use crate::layer2::health;
use crate::layer2::parser::{DepthSnapshot, MessageParser, ParserStats};
use crate::layer2::synchronizer::{
    DataSynchronizer, DepthOutcome, SnapshotOutcome, SynchronizerStats,
};

/// Control senders of every running worker, keyed by canonical product
pub type WorkerRegistry = Arc<RwLock<BTreeMap<String, mpsc::UnboundedSender<ProductEvent>>>>;

/// Everything a product worker reacts to
#[derive(Debug)]
pub enum ProductEvent {
    Subscribe,
    HealthCheck,
    Socket(SocketMessage),
    HandshakeTimeout { generation: u64 },
    ErroredRetry { generation: u64 },
    Snapshot { generation: u64, result: Result<DepthSnapshot, SnapshotError> },
}

/// Shared collaborators handed to every worker
pub struct WorkerContext<C, S> {
    pub connector: Arc<C>,
    pub snapshots: Arc<S>,
    pub ban: Arc<BanController>,
    pub sink: EventSink,
    pub config: Arc<FeedConfig>,
}

impl<C, S> Clone for WorkerContext<C, S> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            snapshots: self.snapshots.clone(),
            ban: self.ban.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        }
    }
}

/// Receiving side of a worker: its own control channel plus socket events
pub struct WorkerInbox {
    control_rx: mpsc::UnboundedReceiver<ProductEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketMessage>,
}

impl WorkerInbox {
    pub async fn recv(&mut self) -> Option<ProductEvent> {
        tokio::select! {
            Some(event) = self.control_rx.recv() => Some(event),
            Some(msg) = self.socket_rx.recv() => Some(ProductEvent::Socket(msg)),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<ProductEvent> {
        if let Ok(event) = self.control_rx.try_recv() {
            return Some(event);
        }
        self.socket_rx.try_recv().ok().map(ProductEvent::Socket)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub product: String,
    pub subscribes: u64,
    pub rejected_subscribes: u64,
    pub handshake_timeouts: u64,
    pub errored_retries: u64,
    pub socket_failures: u64,
    pub health_failures: u64,
    pub snapshot_requests: u64,
    pub stale_events: u64,
    pub trades: u64,
    pub sync: SynchronizerStats,
    pub parser: ParserStats,
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkerStats({}: subscribes={}, rejected={}, timeouts={}, errored_retries={}, socket_failures={}, health_failures={}, snapshots={}, trades={}, {})",
            self.product,
            self.subscribes,
            self.rejected_subscribes,
            self.handshake_timeouts,
            self.errored_retries,
            self.socket_failures,
            self.health_failures,
            self.snapshot_requests,
            self.trades,
            self.sync
        )
    }
}

pub struct ProductWorker<C, S> {
    pub product: String,
    pub symbol: String,
    ctx: WorkerContext<C, S>,

    parser: MessageParser,
    sync: DataSynchronizer,

    pair: Option<ConnectionPair>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    snapshot_retries: u32,

    control_tx: mpsc::UnboundedSender<ProductEvent>,
    socket_tx: mpsc::UnboundedSender<SocketMessage>,

    stats: WorkerStats,
}

impl<C: StreamConnector, S: SnapshotSource> ProductWorker<C, S> {
    pub fn new(product: &str, symbol: &str, ctx: WorkerContext<C, S>) -> (Self, WorkerInbox) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let max_pending = ctx.config.sync.max_pending_deltas;

        let worker = Self {
            product: product.to_string(),
            symbol: symbol.to_uppercase(),
            ctx,
            parser: MessageParser::new(symbol),
            sync: DataSynchronizer::new(product, max_pending),
            pair: None,
            generation: 0,
            timer: None,
            snapshot_retries: 0,
            control_tx,
            socket_tx,
            stats: WorkerStats {
                product: product.to_string(),
                ..WorkerStats::default()
            },
        };

        (worker, WorkerInbox { control_rx, socket_rx })
    }

    /// Sender for control events addressed to this worker
    pub fn sender(&self) -> mpsc::UnboundedSender<ProductEvent> {
        self.control_tx.clone()
    }

    pub fn pair(&self) -> Option<&ConnectionPair> {
        self.pair.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn synchronizer(&self) -> &DataSynchronizer {
        &self.sync
    }

    /// Process events until cancelled
    pub async fn run(mut self, mut inbox: WorkerInbox, cancel: CancellationToken) -> WorkerStats {
        debug!(product = %self.product, "Product worker started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.handle(event) => {}
            }
        }

        self.teardown();
        let stats = self.get_stats();
        info!(product = %self.product, stats = %stats, "Product worker stopped");
        stats
    }

    pub async fn handle(&mut self, event: ProductEvent) {
        match event {
            ProductEvent::Subscribe => self.subscribe().await,
            ProductEvent::HealthCheck => self.check_health().await,
            ProductEvent::Socket(msg) => self.on_socket(msg).await,
            ProductEvent::HandshakeTimeout { generation } => {
                self.on_handshake_timeout(generation).await
            }
            ProductEvent::ErroredRetry { generation } => self.on_errored_retry(generation).await,
            ProductEvent::Snapshot { generation, result } => {
                self.on_snapshot(generation, result).await
            }
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Replace the connection pair. Any previous pair is retired first, so
    /// its late close/error events are ignored.
    pub async fn subscribe(&mut self) {
        if !self.ctx.ban.admit(&self.product).await {
            self.stats.rejected_subscribes += 1;
            self.teardown();
            return;
        }

        self.teardown();
        self.generation += 1;
        let generation = self.generation;

        let base = &self.ctx.config.exchange.ws_base_url;
        let depth_url = stream_url(base, &self.symbol, SocketKind::Depth);
        let trade_url = stream_url(base, &self.symbol, SocketKind::Trade);

        info!(product = %self.product, generation = generation, url = %depth_url, "Subscribing product");

        let depth = self.ctx.connector.open(&depth_url, SocketKind::Depth, generation, self.socket_tx.clone());
        let trade = self.ctx.connector.open(&trade_url, SocketKind::Trade, generation, self.socket_tx.clone());
        self.pair = Some(ConnectionPair::new(generation, depth, trade));
        self.stats.subscribes += 1;

        let timeout = self.ctx.config.connection.handshake_timeout();
        let tx = self.control_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(ProductEvent::HandshakeTimeout { generation });
        }));
    }

    /// Subscribe again after the errored delay unless something else
    /// subscribes first
    fn schedule_errored_retry(&mut self) {
        let delay = self.ctx.config.connection.errored_retry();
        let generation = self.generation;
        let tx = self.control_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ProductEvent::ErroredRetry { generation });
        }));
    }

    /// Retire the current pair and drop all synchronization state
    fn teardown(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(mut old) = self.pair.take() {
            old.retire();
        }
        self.sync.reset();
        self.snapshot_retries = 0;
    }

    async fn on_socket(&mut self, msg: SocketMessage) {
        let Some(pair) = self.pair.as_mut().filter(|p| p.accepts(msg.generation)) else {
            self.stats.stale_events += 1;
            trace!(product = %self.product, generation = msg.generation, socket = %msg.kind, "Event from inactive socket ignored");
            return;
        };

        let now = Instant::now();
        match msg.event {
            SocketEvent::Opened => {
                let socket = pair.socket_mut(msg.kind);
                socket.state = SocketState::Open;
                socket.ping();
                debug!(product = %self.product, socket = %msg.kind, "Socket open, awaiting pong");
            }
            SocketEvent::Pong => {
                let was_connected = pair.is_connected();
                pair.record_pong(msg.kind, now);
                if !was_connected && pair.is_connected() {
                    self.on_connected();
                }
            }
            SocketEvent::Frame(text) => match msg.kind {
                SocketKind::Depth => {
                    pair.last_message_time = Some(now);
                    self.on_depth_frame(&text).await;
                }
                SocketKind::Trade => {
                    pair.last_trade_time = Some(now);
                    self.on_trade_frame(&text);
                }
            },
            SocketEvent::Closed(reason) => {
                pair.socket_mut(msg.kind).state = SocketState::Closed;
                warn!(product = %self.product, socket = %msg.kind, reason = ?reason, "Active socket closed, resubscribing");
                self.stats.socket_failures += 1;
                self.subscribe().await;
            }
            SocketEvent::Error(error) => {
                let socket = pair.socket_mut(msg.kind);
                let during_handshake = socket.state == SocketState::Connecting;
                socket.state = SocketState::Closed;
                self.stats.socket_failures += 1;

                if during_handshake {
                    warn!(product = %self.product, socket = %msg.kind, error = %error, "Handshake failed, product marked errored");
                    self.ctx.ban.mark_errored(&self.product);
                    self.teardown();
                    self.schedule_errored_retry();
                } else {
                    warn!(product = %self.product, socket = %msg.kind, error = %error, "Active socket errored, resubscribing");
                    self.subscribe().await;
                }
            }
        }
    }

    async fn on_handshake_timeout(&mut self, generation: u64) {
        let timed_out = self
            .pair
            .as_ref()
            .map(|p| p.accepts(generation) && !p.is_connected())
            .unwrap_or(false);
        if !timed_out {
            return;
        }

        warn!(product = %self.product, generation = generation, "Handshake timed out, retrying");
        self.stats.handshake_timeouts += 1;
        self.subscribe().await;
    }

    async fn on_errored_retry(&mut self, generation: u64) {
        if self.generation != generation || self.pair.is_some() {
            return;
        }

        info!(product = %self.product, generation = generation, "Retrying errored product");
        self.stats.errored_retries += 1;
        self.subscribe().await;
    }

    fn on_connected(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        info!(product = %self.product, generation = self.generation, "Both sockets live, fetching snapshot");
        self.request_snapshot();
    }

    fn request_snapshot(&mut self) {
        self.sync.mark_snapshot_requested();
        self.stats.snapshot_requests += 1;

        let generation = self.generation;
        let source = self.ctx.snapshots.clone();
        let symbol = self.symbol.clone();
        let tx = self.control_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch_snapshot(&symbol).await;
            let _ = tx.send(ProductEvent::Snapshot { generation, result });
        });
    }

    // ========================================================================
    // Data path
    // ========================================================================

    async fn on_depth_frame(&mut self, text: &str) {
        let update = match self.parser.parse_depth(text) {
            Ok(update) => update,
            Err(e) => {
                debug!(product = %self.product, error = %e, "Depth frame dropped");
                return;
            }
        };

        match self.sync.on_depth(update) {
            DepthOutcome::Buffered | DepthOutcome::Discarded => {}
            DepthOutcome::Applied(events) => self.ctx.sink.publish_all(events),
            DepthOutcome::Restart(reason) => {
                warn!(product = %self.product, reason = %reason, "Restarting product");
                self.subscribe().await;
            }
        }
    }

    fn on_trade_frame(&mut self, text: &str) {
        let trade = match self.parser.parse_trade(text) {
            Ok(trade) => trade,
            Err(e) => {
                debug!(product = %self.product, error = %e, "Trade frame dropped");
                return;
            }
        };

        self.stats.trades += 1;
        self.ctx.sink.publish(NormalizedEvent::Trade(TradeEvent {
            product: self.product.clone(),
            time: trade.event_time,
            trade_id: trade.trade_id.to_string(),
            price: trade.price,
            size: trade.quantity,
            side: Side::from_buyer_maker(trade.is_buyer_maker),
        }));
    }

    async fn on_snapshot(&mut self, generation: u64, result: Result<DepthSnapshot, SnapshotError>) {
        if !self.pair.as_ref().map(|p| p.accepts(generation)).unwrap_or(false) {
            self.stats.stale_events += 1;
            debug!(product = %self.product, generation = generation, "Snapshot for replaced pair ignored");
            return;
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Sockets stay up and keep buffering; the ban sweep or a
                // buffer overflow brings the product back
                warn!(product = %self.product, error = %e, "Error occurred when fetching snapshot");
                self.ctx.ban.report_failure(&self.product, &e);
                return;
            }
        };

        match self.sync.on_snapshot(snapshot, now_millis()) {
            SnapshotOutcome::Synchronized(events) => {
                self.snapshot_retries = 0;
                self.ctx.ban.clear_errored(&self.product);
                self.ctx.sink.publish_all(events);
            }
            SnapshotOutcome::Stale { snapshot_id, earliest_first_id } => {
                self.snapshot_retries += 1;
                let max = self.ctx.config.sync.max_snapshot_retries;
                if self.snapshot_retries > max {
                    warn!(
                        product = %self.product,
                        retries = self.snapshot_retries,
                        snapshot_id = snapshot_id,
                        earliest_first_id = earliest_first_id,
                        "Snapshot still stale after retries, restarting"
                    );
                    self.subscribe().await;
                } else {
                    debug!(product = %self.product, attempt = self.snapshot_retries, "Refetching stale snapshot");
                    self.request_snapshot();
                }
            }
            SnapshotOutcome::Restart(reason) => {
                warn!(product = %self.product, reason = %reason, "Restarting product");
                self.subscribe().await;
            }
        }
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn check_health(&mut self) {
        let Some(pair) = self.pair.as_ref() else {
            debug!(product = %self.product, "No connection pair, health check skipped");
            return;
        };

        pair.ping_both();
        let failures = health::evaluate(pair, Instant::now(), &self.ctx.config.health);
        if failures.is_empty() {
            return;
        }

        let reasons: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
        warn!(product = %self.product, failures = ?reasons, "Health check failed, resubscribing");
        self.stats.health_failures += 1;
        self.subscribe().await;
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            sync: self.sync.get_stats(),
            parser: self.parser.stats.clone(),
            ..self.stats.clone()
        }
    }
}

/// Build a worker and run it on its own task
pub fn spawn_worker<C: StreamConnector, S: SnapshotSource>(
    product: &str,
    symbol: &str,
    ctx: WorkerContext<C, S>,
    cancel: CancellationToken,
) -> (mpsc::UnboundedSender<ProductEvent>, JoinHandle<WorkerStats>) {
    let (worker, inbox) = ProductWorker::new(product, symbol, ctx);
    let tx = worker.sender();
    let handle = tokio::spawn(worker.run(inbox, cancel));
    (tx, handle)
}

// Depth Feed - facade over the per-product workers
// Starts one worker per product, routes retry sweeps and health checks,
// and hands the normalized event stream to the caller.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{ConfigError, FeedConfig};
use crate::core::events::{event_channel, EventSink, EventSinkStats, EventStream};
use crate::core::symbols::ProductMap;
use crate::layer1::ban_controller::{BanController, BanControllerStats, RetrySweep, SweepReason};
use crate::layer1::connection::StreamConnector;
use crate::layer1::rest_client::{RestClientError, SnapshotFetcher, SnapshotSource};
use crate::layer1::websocket::TungsteniteConnector;
use crate::layer2::health::run_health_monitor;
use crate::layer2::worker::{spawn_worker, ProductEvent, WorkerContext, WorkerRegistry, WorkerStats};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("REST client error: {0}")]
    RestClient(#[from] RestClientError),
    #[error("Unknown product: {0}")]
    UnknownProduct(String),
    #[error("Product already subscribed: {0}")]
    AlreadySubscribed(String),
}

type Spawner = Box<
    dyn Fn(&str, &str, CancellationToken) -> (mpsc::UnboundedSender<ProductEvent>, JoinHandle<WorkerStats>)
        + Send
        + Sync,
>;

/// Feed-level statistics
#[derive(Debug, Clone)]
pub struct FeedStats {
    pub products: usize,
    pub errored: usize,
    pub banned: bool,
    pub events: EventSinkStats,
    pub ban: BanControllerStats,
}

impl fmt::Display for FeedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FeedStats(products={}, errored={}, banned={}, {}, {})",
            self.products, self.errored, self.banned, self.events, self.ban
        )
    }
}

pub struct DepthFeed {
    workers: WorkerRegistry,
    worker_tokens: Mutex<HashMap<String, CancellationToken>>,
    worker_handles: Mutex<Vec<JoinHandle<WorkerStats>>>,
    spawner: Spawner,
    product_map: ProductMap,
    ban: Arc<BanController>,
    sink: EventSink,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl DepthFeed {
    /// Start against the live exchange
    pub fn start(config: FeedConfig) -> Result<(Self, EventStream), FeedError> {
        let snapshots = SnapshotFetcher::from_config(&config.exchange)?;
        Ok(Self::start_with(config, TungsteniteConnector, snapshots))
    }

    /// Start with explicit connector and snapshot source. Must be called
    /// from within a tokio runtime.
    pub fn start_with<C: StreamConnector, S: SnapshotSource>(
        config: FeedConfig,
        connector: C,
        snapshots: S,
    ) -> (Self, EventStream) {
        let config = Arc::new(config);
        let (ban, sweep_rx) = BanController::new(&config.throttle);
        let (sink, stream) = event_channel();
        let cancel = CancellationToken::new();

        let ctx = WorkerContext {
            connector: Arc::new(connector),
            snapshots: Arc::new(snapshots),
            ban: ban.clone(),
            sink: sink.clone(),
            config: config.clone(),
        };
        let spawner: Spawner = Box::new(move |product: &str, symbol: &str, token: CancellationToken| {
            spawn_worker(product, symbol, ctx.clone(), token)
        });

        let workers: WorkerRegistry = Arc::new(RwLock::new(BTreeMap::new()));
        let mut background = Vec::new();

        background.push(tokio::spawn(route_sweeps(workers.clone(), sweep_rx, cancel.clone())));

        let initial_delay = Duration::from_secs(config.throttle.initial_retry_delay_secs);
        let initial_ban = ban.clone();
        let initial_cancel = cancel.clone();
        background.push(tokio::spawn(async move {
            tokio::select! {
                _ = initial_cancel.cancelled() => {}
                _ = tokio::time::sleep(initial_delay) => {
                    let count = initial_ban.sweep_errored(SweepReason::Initial);
                    if count == 0 {
                        info!("All products subscribed");
                    }
                }
            }
        }));

        background.push(tokio::spawn(run_health_monitor(
            workers.clone(),
            config.health.clone(),
            cancel.clone(),
        )));

        let feed = Self {
            workers,
            worker_tokens: Mutex::new(HashMap::new()),
            worker_handles: Mutex::new(Vec::new()),
            spawner,
            product_map: ProductMap::new(&config.product_map),
            ban,
            sink,
            cancel,
            background,
        };

        for product in &config.products {
            if let Err(e) = feed.add_product(product) {
                warn!(product = %product, error = %e, "Product skipped");
            }
        }

        info!(products = config.products.len(), "Depth feed started");
        (feed, stream)
    }

    /// Start a worker for a new product and subscribe it
    pub fn add_product(&self, product: &str) -> Result<(), FeedError> {
        let mut workers = self.workers.write();
        if workers.contains_key(product) {
            return Err(FeedError::AlreadySubscribed(product.to_string()));
        }

        let symbol = self.product_map.to_exchange_symbol(product);
        let token = self.cancel.child_token();
        let (tx, handle) = (self.spawner)(product, &symbol, token.clone());
        let _ = tx.send(ProductEvent::Subscribe);

        workers.insert(product.to_string(), tx);
        self.worker_tokens.lock().insert(product.to_string(), token);
        self.worker_handles.lock().push(handle);

        debug!(product = product, symbol = %symbol, "Product worker spawned");
        Ok(())
    }

    /// Force a fresh subscription of a running product
    pub fn subscribe(&self, product: &str) -> Result<(), FeedError> {
        match self.workers.read().get(product) {
            Some(tx) if tx.send(ProductEvent::Subscribe).is_ok() => Ok(()),
            _ => Err(FeedError::UnknownProduct(product.to_string())),
        }
    }

    /// Stop a product's worker; its sockets are closed as it exits
    pub fn unsubscribe(&self, product: &str) -> Result<(), FeedError> {
        if self.workers.write().remove(product).is_none() {
            return Err(FeedError::UnknownProduct(product.to_string()));
        }
        if let Some(token) = self.worker_tokens.lock().remove(product) {
            token.cancel();
        }
        self.ban.clear_errored(product);
        info!(product = product, "Product unsubscribed");
        Ok(())
    }

    /// Resubscribe every errored product once
    pub fn retry_errored(&self) -> usize {
        self.ban.sweep_errored(SweepReason::Manual)
    }

    pub fn errored_products(&self) -> Vec<String> {
        self.ban.errored_products()
    }

    pub fn products(&self) -> Vec<String> {
        self.workers.read().keys().cloned().collect()
    }

    pub fn is_banned(&self) -> bool {
        self.ban.is_banned()
    }

    pub fn product_map(&self) -> &ProductMap {
        &self.product_map
    }

    pub fn get_stats(&self) -> FeedStats {
        FeedStats {
            products: self.workers.read().len(),
            errored: self.ban.errored_products().len(),
            banned: self.ban.is_banned(),
            events: self.sink.get_stats(),
            ban: self.ban.get_stats(),
        }
    }

    /// Stop every worker and background task, closing all sockets
    pub async fn shutdown(self) -> Vec<WorkerStats> {
        info!("Shutting down depth feed");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<WorkerStats>> = std::mem::take(&mut *self.worker_handles.lock());
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(s) => stats.push(s),
                Err(e) => warn!(error = %e, "Worker task failed"),
            }
        }
        for task in self.background {
            let _ = task.await;
        }

        let summary = FeedStats {
            products: stats.len(),
            errored: self.ban.errored_products().len(),
            banned: self.ban.is_banned(),
            events: self.sink.get_stats(),
            ban: self.ban.get_stats(),
        };
        for worker in &stats {
            info!(stats = %worker, "Worker summary");
        }
        info!(stats = %summary, "Depth feed stopped");
        stats
    }
}

/// Deliver each retry sweep as one Subscribe per product
async fn route_sweeps(
    workers: WorkerRegistry,
    mut sweep_rx: mpsc::UnboundedReceiver<RetrySweep>,
    cancel: CancellationToken,
) {
    loop {
        let sweep = tokio::select! {
            _ = cancel.cancelled() => break,
            sweep = sweep_rx.recv() => match sweep {
                Some(sweep) => sweep,
                None => break,
            },
        };

        let targets = workers.read();
        for product in &sweep.products {
            match targets.get(product) {
                Some(tx) => {
                    let _ = tx.send(ProductEvent::Subscribe);
                }
                None => debug!(product = %product, "Errored product no longer subscribed"),
            }
        }
        info!(reason = ?sweep.reason, count = sweep.products.len(), "Retry sweep dispatched");
    }
}

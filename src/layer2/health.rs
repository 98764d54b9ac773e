// Health Monitor - periodic liveness sweep over every product's socket pair
// Catches half-open connections the socket layer never reports.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::HealthConfig;
use crate::core::types::SocketKind;
use crate::layer1::connection::ConnectionPair;
use crate::layer2::worker::{ProductEvent, WorkerRegistry};

/// One failed liveness condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    PongTimeout { socket: SocketKind, age: Duration },
    SocketClosed { socket: SocketKind },
    DepthStale { age: Duration },
    TradeStale { age: Duration },
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthFailure::PongTimeout { socket, age } => {
                write!(f, "no pong on {} socket for {}s", socket, age.as_secs())
            }
            HealthFailure::SocketClosed { socket } => write!(f, "{} socket closed", socket),
            HealthFailure::DepthStale { age } => write!(f, "no depth message for {}s", age.as_secs()),
            HealthFailure::TradeStale { age } => write!(f, "no trade message for {}s", age.as_secs()),
        }
    }
}

/// Evaluate a pair against the liveness thresholds. Timestamps that were
/// never set count from the moment the pair was created.
pub fn evaluate(pair: &ConnectionPair, now: Instant, config: &HealthConfig) -> Vec<HealthFailure> {
    let mut failures = Vec::new();
    let since = |t: Option<Instant>| now.saturating_duration_since(t.unwrap_or(pair.created_at));

    let pong_timeout = Duration::from_secs(config.pong_timeout_secs);
    for kind in [SocketKind::Depth, SocketKind::Trade] {
        let socket = pair.socket(kind);
        let age = since(socket.last_pong);
        if age > pong_timeout {
            failures.push(HealthFailure::PongTimeout { socket: kind, age });
        }
        if socket.is_closed_or_closing() {
            failures.push(HealthFailure::SocketClosed { socket: kind });
        }
    }

    let depth_age = since(pair.last_message_time);
    if depth_age > Duration::from_secs(config.depth_stale_secs) {
        failures.push(HealthFailure::DepthStale { age: depth_age });
    }

    let trade_age = since(pair.last_trade_time);
    if trade_age > Duration::from_secs(config.trade_stale_secs) {
        failures.push(HealthFailure::TradeStale { age: trade_age });
    }

    failures
}

/// Send a health check to every registered worker: first after
/// `initial_delay_secs`, then every `interval_secs`.
pub async fn run_health_monitor(workers: WorkerRegistry, config: HealthConfig, cancel: CancellationToken) {
    let start = Instant::now() + Duration::from_secs(config.initial_delay_secs);
    let mut interval = tokio::time::interval_at(start, Duration::from_secs(config.interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        initial_delay_secs = config.initial_delay_secs,
        interval_secs = config.interval_secs,
        "Health monitor started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let targets = workers.read();
                debug!(products = targets.len(), "Health sweep");
                for (product, tx) in targets.iter() {
                    if tx.send(ProductEvent::HealthCheck).is_err() {
                        debug!(product = %product, "Worker gone, skipping health check");
                    }
                }
            }
        }
    }

    info!("Health monitor stopped");
}

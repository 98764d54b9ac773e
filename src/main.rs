// depth-sync - run the feed and log normalized events until Ctrl-C
//
// Usage: depth-sync [config.json]

use tracing::{error, info, trace};

use depth_sync::core::{setup_logging_from, ConfigManager};
use depth_sync::{DepthFeed, NormalizedEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let manager = ConfigManager::new(config_path.as_deref())?;
    let config = manager.config();

    setup_logging_from(&config.monitoring);
    manager.validate()?;
    info!(summary = ?manager.get_summary(), "Starting depth sync");

    let (feed, mut events) = DepthFeed::start(config)?;

    let mut snapshots: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
            event = events.recv() => match event {
                Some(NormalizedEvent::Snapshot(s)) => {
                    snapshots += 1;
                    info!(product = %s.product, source_sequence = s.source_sequence, bids = s.bids.len(), asks = s.asks.len(), "Snapshot");
                }
                Some(event) => trace!(event = %event, "Event"),
                None => {
                    error!("Event stream closed");
                    break;
                }
            }
        }
    }

    info!(snapshots = snapshots, stats = %feed.get_stats(), "Stopping");
    feed.shutdown().await;
    Ok(())
}

// Output Event Channel for Depth Sync
// Push-style delivery of normalized events to downstream consumers

use std::fmt;
use std::sync::Arc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::types::NormalizedEvent;

#[derive(Debug, Clone, Default)]
struct SinkStats {
    snapshots: u64,
    levels: u64,
    trades: u64,
    dropped: u64,
}

/// Producer side, cloned into every product worker.
///
/// The channel is unbounded so a slow consumer never blocks the emitting
/// path; the consumer buffers by simply not draining yet.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NormalizedEvent>,
    stats: Arc<RwLock<SinkStats>>,
}

/// Consumer side of the normalized event stream
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<NormalizedEvent>,
}

pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink {
            tx,
            stats: Arc::new(RwLock::new(SinkStats::default())),
        },
        EventStream { rx },
    )
}

impl EventSink {
    /// Publish one event. Returns false once the consumer has gone away.
    pub fn publish(&self, event: NormalizedEvent) -> bool {
        {
            let mut stats = self.stats.write();
            match &event {
                NormalizedEvent::Snapshot(_) => stats.snapshots += 1,
                NormalizedEvent::Level(_) => stats.levels += 1,
                NormalizedEvent::Trade(_) => stats.trades += 1,
            }
        }

        if self.tx.send(event).is_err() {
            let mut stats = self.stats.write();
            stats.dropped += 1;
            if stats.dropped == 1 {
                warn!("Event consumer dropped, discarding further events");
            }
            return false;
        }
        true
    }

    pub fn publish_all(&self, events: Vec<NormalizedEvent>) {
        for event in events {
            if !self.publish(event) {
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn get_stats(&self) -> EventSinkStats {
        let stats = self.stats.read();
        EventSinkStats {
            snapshots: stats.snapshots,
            levels: stats.levels,
            trades: stats.trades,
            dropped: stats.dropped,
        }
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NormalizedEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered, without waiting
    pub fn drain(&mut self) -> Vec<NormalizedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Snapshot of sink statistics
#[derive(Debug, Clone, PartialEq)]
pub struct EventSinkStats {
    pub snapshots: u64,
    pub levels: u64,
    pub trades: u64,
    pub dropped: u64,
}

impl fmt::Display for EventSinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventSinkStats(snapshots={}, levels={}, trades={}, dropped={})",
            self.snapshots, self.levels, self.trades, self.dropped
        )
    }
}

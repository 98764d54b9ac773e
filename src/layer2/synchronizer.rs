// Data Synchronizer - snapshot/delta reconciliation per product
// Turns REST snapshots + buffered and live depth deltas into a gap-free,
// sequenced stream of normalized book events.
//
// The synchronizer is a plain synchronous state machine. It never performs
// I/O: a `Restart` outcome tells the owning worker to resubscribe.

use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

use crate::core::types::{LevelEvent, NormalizedEvent, PriceLevel, Side, SnapshotEvent};
use crate::layer2::parser::{DepthSnapshot, DepthUpdate};

/// `update_counter()` value while no snapshot has been applied
pub const AWAITING_SNAPSHOT: i64 = -1;

/// Stream synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Buffering deltas, no snapshot requested yet
    AwaitingSnapshot,
    /// Buffering deltas while a snapshot request is in flight
    SnapshotRequested,
    /// Snapshot applied, live deltas pass through
    Streaming,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why the product has to be torn down and resubscribed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    BufferOverflow { buffered: usize },
    DrainGap { expected: u64, first_update_id: u64 },
    StreamGap { expected: u64, first_update_id: u64 },
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::BufferOverflow { buffered } => {
                write!(f, "pending delta queue overflow ({} buffered)", buffered)
            }
            RestartReason::DrainGap { expected, first_update_id } => write!(
                f,
                "buffered delta gap: expected {} got first id {}",
                expected, first_update_id
            ),
            RestartReason::StreamGap { expected, first_update_id } => write!(
                f,
                "live delta gap: expected {} got first id {}",
                expected, first_update_id
            ),
        }
    }
}

/// Result of feeding one depth delta
#[derive(Debug, Clone, PartialEq)]
pub enum DepthOutcome {
    Buffered,
    Applied(Vec<NormalizedEvent>),
    /// Already covered by the snapshot or an earlier delta
    Discarded,
    Restart(RestartReason),
}

/// Result of feeding one REST snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    /// Snapshot predates the oldest buffered delta; fetch again
    Stale { snapshot_id: u64, earliest_first_id: u64 },
    /// Snapshot event followed by every drained buffered delta
    Synchronized(Vec<NormalizedEvent>),
    Restart(RestartReason),
}

/// Per-product reconciliation state machine
pub struct DataSynchronizer {
    pub product: String,

    /// Next expected update id; None until a snapshot is applied
    next_update_id: Option<u64>,
    pending: VecDeque<DepthUpdate>,
    max_pending: usize,
    snapshot_requested: bool,

    /// Last emitted feed sequence; 0 right after a snapshot
    sequence: u64,

    stats: SynchronizerStats,
}

impl DataSynchronizer {
    pub fn new(product: &str, max_pending: usize) -> Self {
        debug!(product = product, max_pending = max_pending, "DataSynchronizer created");

        Self {
            product: product.to_string(),
            next_update_id: None,
            pending: VecDeque::with_capacity(max_pending.min(1024) + 1),
            max_pending,
            snapshot_requested: false,
            sequence: 0,
            stats: SynchronizerStats::default(),
        }
    }

    pub fn state(&self) -> SyncState {
        if self.next_update_id.is_some() {
            SyncState::Streaming
        } else if self.snapshot_requested {
            SyncState::SnapshotRequested
        } else {
            SyncState::AwaitingSnapshot
        }
    }

    /// Signed view of the counter: AWAITING_SNAPSHOT until a snapshot is
    /// applied. Ids past `i64::MAX` saturate; use `next_update_id` for the
    /// exact value.
    pub fn update_counter(&self) -> i64 {
        match self.next_update_id {
            Some(id) => i64::try_from(id).unwrap_or(i64::MAX),
            None => AWAITING_SNAPSHOT,
        }
    }

    pub fn next_update_id(&self) -> Option<u64> {
        self.next_update_id
    }

    pub fn is_synchronized(&self) -> bool {
        self.state() == SyncState::Streaming
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    /// Both sockets are live and a snapshot fetch has been issued
    pub fn mark_snapshot_requested(&mut self) {
        if self.next_update_id.is_none() {
            self.snapshot_requested = true;
        }
    }

    /// Drop all buffered state and go back to buffering
    pub fn reset(&mut self) {
        self.pending.clear();
        self.next_update_id = None;
        self.snapshot_requested = false;
    }

    /// Feed one depth delta from the live socket
    pub fn on_depth(&mut self, update: DepthUpdate) -> DepthOutcome {
        let Some(expected) = self.next_update_id else {
            self.pending.push_back(update);
            self.stats.deltas_buffered += 1;

            if self.pending.len() > self.max_pending {
                let buffered = self.pending.len();
                warn!(product = %self.product, buffered = buffered, "Max queue length reached, restarting feed");
                return DepthOutcome::Restart(self.restart(RestartReason::BufferOverflow { buffered }));
            }
            return DepthOutcome::Buffered;
        };

        if update.final_update_id < expected {
            self.stats.deltas_discarded += 1;
            return DepthOutcome::Discarded;
        }

        if update.first_update_id > expected {
            warn!(
                product = %self.product,
                expected = expected,
                got = update.first_update_id,
                "Skipped message, restarting feed"
            );
            return DepthOutcome::Restart(self.restart(RestartReason::StreamGap {
                expected,
                first_update_id: update.first_update_id,
            }));
        }

        let mut events = Vec::with_capacity(update.bids.len() + update.asks.len());
        self.apply(&update, &mut events);
        DepthOutcome::Applied(events)
    }

    /// Reconcile a REST snapshot with the buffered deltas
    pub fn on_snapshot(&mut self, snapshot: DepthSnapshot, time: u64) -> SnapshotOutcome {
        if let Some(earliest) = self.pending.front() {
            if earliest.first_update_id > snapshot.last_update_id {
                info!(
                    product = %self.product,
                    earliest = earliest.first_update_id,
                    snapshot = snapshot.last_update_id,
                    "Snapshot still old"
                );
                self.stats.stale_snapshots += 1;
                return SnapshotOutcome::Stale {
                    snapshot_id: snapshot.last_update_id,
                    earliest_first_id: earliest.first_update_id,
                };
            }
        }

        if self.next_update_id.is_some() {
            warn!(product = %self.product, "Snapshot received while streaming, re-baselining");
        }

        self.next_update_id = Some(snapshot.last_update_id.saturating_add(1));
        self.snapshot_requested = false;
        self.sequence = 0;
        self.stats.snapshots_applied += 1;

        let mut events = Vec::with_capacity(1 + self.pending.len());
        events.push(NormalizedEvent::Snapshot(SnapshotEvent {
            product: self.product.clone(),
            time,
            sequence: 0,
            source_sequence: snapshot.last_update_id,
            bids: snapshot.bids,
            asks: snapshot.asks,
        }));

        // Drain oldest-first
        while let Some(delta) = self.pending.pop_front() {
            let Some(expected) = self.next_update_id else {
                break;
            };

            if delta.final_update_id < expected {
                self.stats.deltas_discarded += 1;
                continue;
            }

            if delta.first_update_id <= expected {
                self.apply(&delta, &mut events);
                continue;
            }

            warn!(
                product = %self.product,
                expected = expected,
                got = delta.first_update_id,
                "Queued message doesn't match the request criteria, restarting"
            );
            return SnapshotOutcome::Restart(self.restart(RestartReason::DrainGap {
                expected,
                first_update_id: delta.first_update_id,
            }));
        }

        info!(
            product = %self.product,
            last_update_id = snapshot.last_update_id,
            counter = ?self.next_update_id,
            "Snapshot applied, streaming"
        );
        SnapshotOutcome::Synchronized(events)
    }

    fn apply(&mut self, delta: &DepthUpdate, events: &mut Vec<NormalizedEvent>) {
        self.emit_levels(&delta.bids, Side::Buy, delta.event_time, events);
        self.emit_levels(&delta.asks, Side::Sell, delta.event_time, events);
        self.next_update_id = Some(delta.final_update_id.saturating_add(1));
        self.stats.deltas_applied += 1;
    }

    fn emit_levels(
        &mut self,
        levels: &[PriceLevel],
        side: Side,
        time: u64,
        events: &mut Vec<NormalizedEvent>,
    ) {
        for level in levels {
            self.sequence += 1;
            events.push(NormalizedEvent::Level(LevelEvent {
                product: self.product.clone(),
                time,
                price: level.price,
                size: level.size,
                side,
                sequence: self.sequence,
                count: 1,
            }));
        }
    }

    fn restart(&mut self, reason: RestartReason) -> RestartReason {
        self.reset();
        self.stats.restarts += 1;
        reason
    }

    pub fn get_stats(&self) -> SynchronizerStats {
        SynchronizerStats {
            state: Some(self.state()),
            pending: self.pending.len(),
            ..self.stats.clone()
        }
    }
}

/// Synchronizer statistics
#[derive(Debug, Clone, Default)]
pub struct SynchronizerStats {
    pub state: Option<SyncState>,
    pub pending: usize,
    pub snapshots_applied: u64,
    pub stale_snapshots: u64,
    pub deltas_buffered: u64,
    pub deltas_applied: u64,
    pub deltas_discarded: u64,
    pub restarts: u64,
}

impl fmt::Display for SynchronizerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SynchronizerStats(state={:?}, pending={}, snapshots={}, applied={}, discarded={}, restarts={})",
            self.state,
            self.pending,
            self.snapshots_applied,
            self.deltas_applied,
            self.deltas_discarded,
            self.restarts
        )
    }
}

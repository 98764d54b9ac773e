// Connection Pair - the depth + trade sockets owned by one product
// Socket events carry the generation of the pair that produced them, so a
// replaced pair can never trigger recovery.

use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::core::types::{SocketKind, SocketState};

// ============================================================================
// Socket events & commands
// ============================================================================

/// What a socket task reports back to its product worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Frame(String),
    Pong,
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketMessage {
    pub generation: u64,
    pub kind: SocketKind,
    pub event: SocketEvent,
}

/// What a product worker can ask of a socket task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCommand {
    Ping,
    Close,
}

// ============================================================================
// Connector seam
// ============================================================================

/// Opens one socket and reports its lifecycle on `events`
pub trait StreamConnector: Send + Sync + 'static {
    fn open(
        &self,
        url: &str,
        kind: SocketKind,
        generation: u64,
        events: mpsc::UnboundedSender<SocketMessage>,
    ) -> SocketHandle;
}

// ============================================================================
// Socket handle
// ============================================================================

pub struct SocketHandle {
    pub kind: SocketKind,
    pub generation: u64,
    pub state: SocketState,
    pub last_pong: Option<Instant>,
    commands: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn new(kind: SocketKind, generation: u64, commands: mpsc::UnboundedSender<SocketCommand>) -> Self {
        Self {
            kind,
            generation,
            state: SocketState::Connecting,
            last_pong: None,
            commands,
        }
    }

    /// Returns false if the socket task has already gone
    pub fn ping(&self) -> bool {
        self.commands.send(SocketCommand::Ping).is_ok()
    }

    pub fn close(&mut self) {
        if !self.state.is_closed_or_closing() {
            self.state = SocketState::Closing;
        }
        let _ = self.commands.send(SocketCommand::Close);
    }

    pub fn is_closed_or_closing(&self) -> bool {
        self.state.is_closed_or_closing() || self.commands.is_closed()
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("last_pong", &self.last_pong)
            .finish()
    }
}

// ============================================================================
// Connection pair
// ============================================================================

/// Exactly two sockets for one product plus liveness bookkeeping
#[derive(Debug)]
pub struct ConnectionPair {
    pub generation: u64,
    /// Cleared when the pair is being replaced; events from an inactive
    /// pair are ignored
    pub active: bool,
    pub depth: SocketHandle,
    pub trade: SocketHandle,
    pub created_at: Instant,
    pub last_message_time: Option<Instant>,
    pub last_trade_time: Option<Instant>,
}

impl ConnectionPair {
    pub fn new(generation: u64, depth: SocketHandle, trade: SocketHandle) -> Self {
        Self {
            generation,
            active: true,
            depth,
            trade,
            created_at: Instant::now(),
            last_message_time: None,
            last_trade_time: None,
        }
    }

    pub fn socket(&self, kind: SocketKind) -> &SocketHandle {
        match kind {
            SocketKind::Depth => &self.depth,
            SocketKind::Trade => &self.trade,
        }
    }

    pub fn socket_mut(&mut self, kind: SocketKind) -> &mut SocketHandle {
        match kind {
            SocketKind::Depth => &mut self.depth,
            SocketKind::Trade => &mut self.trade,
        }
    }

    /// Whether an event tagged with `generation` belongs to the live pair
    pub fn accepts(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }

    /// Both sockets have answered a ping at least once
    pub fn is_connected(&self) -> bool {
        self.depth.last_pong.is_some() && self.trade.last_pong.is_some()
    }

    pub fn record_pong(&mut self, kind: SocketKind, at: Instant) {
        self.socket_mut(kind).last_pong = Some(at);
    }

    pub fn ping_both(&self) {
        self.depth.ping();
        self.trade.ping();
    }

    /// Deactivate, then close both sockets
    pub fn retire(&mut self) {
        self.active = false;
        self.depth.close();
        self.trade.close();
        debug!(generation = self.generation, "Connection pair retired");
    }
}

//! Connection lifecycle: `Connecting -> Open -> Closing -> Closed`.
//!
//! Transitions only move forward. `Connecting` may skip straight to
//! `Closing` when registration never happens.

use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

use cardsocket_cluster::ConnectionId;
use cardsocket_core::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open | Self::Closing)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Why the receive loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame
    PeerClosed,
    /// Stream ended without a close frame
    EndOfStream,
    ReadError(String),
    /// Closed from our side: displaced by a newer connection or failed write
    ClosedByServer,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::EndOfStream => write!(f, "end of stream"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::ClosedByServer => write!(f, "closed by server"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Tracks one connection through its lifecycle
#[derive(Debug)]
pub struct Session {
    client_id: ClientId,
    connection_id: ConnectionId,
    state: ConnectionState,
    started_at: Instant,
}

impl Session {
    #[must_use]
    pub fn new(client_id: ClientId, connection_id: ConnectionId) -> Self {
        Self {
            client_id,
            connection_id,
            state: ConnectionState::Connecting,
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn open(&mut self) -> bool {
        let opened = self.transition(ConnectionState::Open);
        if opened {
            info!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                "WebSocket connection established"
            );
        }
        opened
    }

    pub fn begin_closing(&mut self, reason: &CloseReason) -> bool {
        let closing = self.transition(ConnectionState::Closing);
        if closing {
            debug!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                reason = %reason,
                "WebSocket connection closing"
            );
        }
        closing
    }

    pub fn finish(&mut self) -> bool {
        let closed = self.transition(ConnectionState::Closed);
        if closed {
            info!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                duration_ms = self.started_at.elapsed().as_millis() as u64,
                "WebSocket connection closed"
            );
        }
        closed
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                connection_id = %self.connection_id,
                from = ?self.state,
                to = ?next,
                "Rejected connection state transition"
            );
            return false;
        }
        self.state = next;
        true
    }
}

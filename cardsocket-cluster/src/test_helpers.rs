//! Test doubles shared by the relay unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::relay::{Connection, ConnectionId, Payload};

/// How a `RecordingConnection` reacts to writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBehavior {
    Accept,
    Fail,
    Stall,
    /// Fails like a peer reset, after the write has been in flight a while
    ResetAfter(Duration),
}

/// In-memory connection that records every payload written to it
pub struct RecordingConnection {
    id: ConnectionId,
    behavior: WriteBehavior,
    received: Mutex<Vec<Payload>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(WriteBehavior::Accept)
    }

    pub fn with_behavior(behavior: WriteBehavior) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            behavior,
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn received(&self) -> Vec<Payload> {
        self.received.lock().clone()
    }

    /// Number of `close` calls that actually closed the connection
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        match self.behavior {
            WriteBehavior::Accept => {
                self.received.lock().push(payload);
                Ok(())
            }
            WriteBehavior::Fail => Err(Error::Write("connection reset by peer".to_string())),
            WriteBehavior::Stall => std::future::pending().await,
            WriteBehavior::ResetAfter(delay) => {
                tokio::time::sleep(delay).await;
                Err(Error::Write("connection reset by peer".to_string()))
            }
        }
    }

    fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Payload;
use super::registry::ConnectionRegistry;
use crate::error::{Error, Result};

/// Consumer half of the fan-out queue
pub type FanoutReceiver = mpsc::Receiver<Payload>;

/// Producer handle for the local fan-out queue.
///
/// Cheap to clone. `enqueue` never waits: a full queue drops the payload
/// and reports `Error::QueueFull`.
#[derive(Clone)]
pub struct FanoutQueue {
    tx: mpsc::Sender<Payload>,
    capacity: usize,
}

impl FanoutQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, FanoutReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }

    pub fn enqueue(&self, payload: Payload) -> Result<()> {
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(payload) => {
                warn!(
                    capacity = self.capacity,
                    bytes = payload.len(),
                    "Fan-out queue full, dropping payload"
                );
                Error::QueueFull(self.capacity)
            }
            TrySendError::Closed(_) => Error::QueueClosed,
        })
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payloads waiting to be drained
    #[must_use]
    pub fn pending(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single drain task: one registry broadcast per payload, in order.
pub struct FanoutWorker {
    rx: FanoutReceiver,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl FanoutWorker {
    #[must_use]
    pub const fn new(rx: FanoutReceiver, registry: Arc<ConnectionRegistry>, cancel: CancellationToken) -> Self {
        Self { rx, registry, cancel }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Fan-out worker started");
        loop {
            let payload = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("Fan-out worker cancelled");
                    break;
                }
                payload = self.rx.recv() => payload,
            };

            let Some(payload) = payload else {
                debug!("All fan-out producers dropped, worker exiting");
                break;
            };

            self.registry.broadcast(&payload).await;
        }
    }
}

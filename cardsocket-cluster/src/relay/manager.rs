//! Relay wiring.
//!
//! `Relay` owns the registry, the fan-out queue and its worker, and the
//! broker bridge, and ties their background tasks to one cancellation token.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cardsocket_core::{ClientId, Config, DeliveryMode};

use super::bridge::{BridgeOptions, RelayBridge, BROKER_TIMEOUT, INITIAL_BACKOFF, MAX_BACKOFF};
use super::broker::Broker;
use super::connection::Payload;
use super::fanout::{FanoutQueue, FanoutWorker};
use super::registry::ConnectionRegistry;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub node_id: String,
    pub channel: String,
    pub delivery_mode: DeliveryMode,
    pub fanout_queue_capacity: usize,
    pub publish_queue_capacity: usize,
    pub write_timeout: Duration,
    pub broker_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RelayOptions {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            channel: "messages".to_string(),
            delivery_mode: DeliveryMode::default(),
            fanout_queue_capacity: 10_000,
            publish_queue_capacity: 10_000,
            write_timeout: Duration::from_secs(5),
            broker_timeout: BROKER_TIMEOUT,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn from_config(config: &Config, node_id: impl Into<String>) -> Self {
        Self {
            channel: config.redis.channel.clone(),
            delivery_mode: config.relay.delivery_mode,
            fanout_queue_capacity: config.relay.fanout_queue_capacity,
            publish_queue_capacity: config.relay.publish_queue_capacity,
            write_timeout: config.relay.write_timeout(),
            broker_timeout: Duration::from_secs(config.redis.connect_timeout_seconds),
            ..Self::new(node_id)
        }
    }

    fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            channel: self.channel.clone(),
            node_id: self.node_id.clone(),
            delivery_mode: self.delivery_mode,
            publish_queue_capacity: self.publish_queue_capacity,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            op_timeout: self.broker_timeout,
        }
    }
}

/// A running relay node
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    fanout: FanoutQueue,
    bridge: Arc<RelayBridge>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    /// Build the components and spawn the fan-out worker and bridge tasks
    pub fn start(broker: Arc<dyn Broker>, options: RelayOptions) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new(options.write_timeout));

        let (fanout, fanout_rx) = FanoutQueue::new(options.fanout_queue_capacity);
        let worker = FanoutWorker::new(fanout_rx, registry.clone(), cancel.child_token()).spawn();

        let (bridge, mut tasks) = RelayBridge::start(
            broker,
            options.bridge_options(),
            fanout.clone(),
            cancel.child_token(),
        );
        tasks.push(worker);

        info!(
            node_id = %options.node_id,
            channel = %options.channel,
            delivery_mode = ?options.delivery_mode,
            "Relay started"
        );

        Arc::new(Self {
            registry,
            fanout,
            bridge,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn fanout(&self) -> &FanoutQueue {
        &self.fanout
    }

    #[must_use]
    pub const fn bridge(&self) -> &Arc<RelayBridge> {
        &self.bridge
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        self.bridge.node_id()
    }

    #[must_use]
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.bridge.delivery_mode()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Route a payload read from `client_id`.
    ///
    /// Always published to the broker. In `LocalFirst` mode it is also queued
    /// for local fan-out right away. Neither step waits; an error means the
    /// payload was dropped, the connection itself stays usable.
    pub fn handle_inbound(&self, client_id: &ClientId, payload: Payload) -> Result<()> {
        if !self.is_running() {
            return Err(Error::QueueClosed);
        }

        debug!(
            client_id = %client_id,
            kind = ?payload.kind,
            bytes = payload.len(),
            "Inbound payload"
        );

        if self.delivery_mode() == DeliveryMode::LocalFirst {
            if let Err(e) = self.fanout.enqueue(payload.clone()) {
                warn!(client_id = %client_id, error = %e, "Failed to queue payload for local fan-out");
            }
        }

        self.bridge.publish(payload).inspect_err(|e| {
            warn!(client_id = %client_id, error = %e, "Failed to queue payload for publishing");
        })
    }

    /// Stop background tasks and close every registered connection
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(node_id = %self.node_id(), "Shutting down relay");
        self.cancel.cancel();

        let closed = self.registry.close_all().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay task ended abnormally");
            }
        }

        info!(closed_connections = closed, "Relay stopped");
    }
}

//! Pub/sub broker abstraction.
//!
//! The relay only needs two things from a broker: publish bytes to a named
//! channel, and a stream of every payload published to that channel. The
//! stream ending means the subscription was lost; the caller resubscribes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio::time::timeout;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Stream of raw payloads received on a subscribed channel
pub type PayloadStream = BoxStream<'static, Bytes>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream>;
}

/// Redis pub/sub broker.
///
/// Publishing goes through a lazily created `ConnectionManager`, which
/// reconnects on its own; publishes during a reconnect window fail.
/// Every subscription opens a dedicated pub/sub connection.
pub struct RedisBroker {
    client: RedisClient,
    publisher: OnceCell<ConnectionManager>,
    op_timeout: Duration,
}

impl RedisBroker {
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            publisher: OnceCell::new(),
            op_timeout,
        })
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        self.publisher
            .get_or_try_init(|| async {
                let manager = timeout(self.op_timeout, self.client.get_connection_manager())
                    .await
                    .map_err(|_| Error::BrokerPublish("Timed out connecting to Redis".to_string()))?
                    .map_err(|e| Error::BrokerPublish(format!("Failed to connect to Redis: {e}")))?;
                info!("Redis publisher connected");
                Ok::<_, Error>(manager)
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.publisher().await?;

        let receivers: i64 = timeout(self.op_timeout, conn.publish(channel, payload.to_vec()))
            .await
            .map_err(|_| Error::BrokerPublish("Timed out publishing to Redis".to_string()))?
            .map_err(|e| Error::BrokerPublish(e.to_string()))?;

        debug!(channel = %channel, receivers = receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        let mut pubsub = timeout(self.op_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| Error::BrokerSubscribe("Timed out getting Redis Pub/Sub connection".to_string()))?
            .map_err(|e| Error::BrokerSubscribe(format!("Failed to get Redis Pub/Sub connection: {e}")))?;

        timeout(self.op_timeout, pubsub.subscribe(channel))
            .await
            .map_err(|_| Error::BrokerSubscribe(format!("Timed out subscribing to {channel}")))?
            .map_err(|e| Error::BrokerSubscribe(format!("Failed to subscribe to {channel}: {e}")))?;

        info!(channel = %channel, "Redis subscriber connected");

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }
}

/// In-process broker for single-node deployments and tests.
///
/// `disconnect` simulates an outage: live subscriptions end and every call
/// fails until `reconnect`.
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
    offline: AtomicBool,
}

impl MemoryBroker {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            offline: AtomicBool::new(false),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn disconnect(&self) {
        self.offline.store(true, Ordering::SeqCst);
        self.channels.lock().clear();
        warn!("Memory broker disconnected");
    }

    pub fn reconnect(&self) {
        self.offline.store(false, Ordering::SeqCst);
        info!("Memory broker reconnected");
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    /// Live subscriptions on `channel`
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        if !self.is_online() {
            return Err(Error::BrokerPublish("broker offline".to_string()));
        }
        // No subscribers is not an error, same as Redis
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        debug!(channel = %channel, receivers = receivers, "Published to memory broker");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream> {
        if !self.is_online() {
            return Err(Error::BrokerSubscribe("broker offline".to_string()));
        }
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let payload = match item {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped = skipped, "Memory broker subscriber lagged");
                    None
                }
            };
            futures::future::ready(payload)
        });
        Ok(stream.boxed())
    }
}

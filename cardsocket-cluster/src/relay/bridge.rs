use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cardsocket_core::DeliveryMode;

use super::broker::Broker;
use super::connection::{Payload, PayloadKind};
use super::fanout::FanoutQueue;
use crate::error::{Error, Result};

/// Initial backoff delay for subscriber reconnection
pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff delay for subscriber reconnection
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Timeout for a single broker operation
pub(crate) const BROKER_TIMEOUT: Duration = Duration::from_secs(5);

/// What travels over the broker.
///
/// `node_id` identifies the publishing process. `data` is the base64 payload
/// so binary frames survive the JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub node_id: String,
    pub kind: PayloadKind,
    pub data: String,
}

impl RelayFrame {
    #[must_use]
    pub fn new(node_id: &str, payload: &Payload) -> Self {
        Self {
            node_id: node_id.to_string(),
            kind: payload.kind,
            data: BASE64.encode(&payload.data),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn into_payload(self) -> Result<Payload> {
        let data = BASE64.decode(self.data.as_bytes())?;
        Ok(Payload {
            kind: self.kind,
            data: Bytes::from(data),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub channel: String,
    pub node_id: String,
    pub delivery_mode: DeliveryMode,
    pub publish_queue_capacity: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub op_timeout: Duration,
}

impl BridgeOptions {
    pub fn new(channel: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            node_id: node_id.into(),
            delivery_mode: DeliveryMode::default(),
            publish_queue_capacity: 10_000,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            op_timeout: BROKER_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

/// Bridge counters
#[derive(Debug, Clone, Default)]
pub struct BridgeMetrics {
    pub published: u64,
    pub publish_failures: u64,
    pub publish_dropped: u64,
    pub received: u64,
    pub dropped_own: u64,
    pub decode_failures: u64,
    /// Broker messages that were not relay frames, forwarded as-is
    pub raw_forwarded: u64,
    pub fanout_dropped: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    publish_dropped: AtomicU64,
    received: AtomicU64,
    dropped_own: AtomicU64,
    decode_failures: AtomicU64,
    raw_forwarded: AtomicU64,
    fanout_dropped: AtomicU64,
}

/// Why a subscriber session ended
enum SubscriberExit {
    /// Subscribed, then the stream ended
    Disconnected,
    /// Could not subscribe at all
    ConnectFailed(Error),
    Cancelled,
}

/// Connects this process to every other process through the broker.
///
/// Payloads read locally are published on the shared channel by a dedicated
/// publisher task. A subscriber task pushes every frame received on the
/// channel into the local fan-out queue, resubscribing with exponential
/// backoff whenever the subscription is lost.
pub struct RelayBridge {
    broker: Arc<dyn Broker>,
    options: BridgeOptions,
    fanout: FanoutQueue,
    publish_tx: mpsc::Sender<Payload>,
    subscribed: AtomicBool,
    counters: Counters,
    cancel: CancellationToken,
}

impl RelayBridge {
    /// Spawn the publisher and subscriber tasks
    pub fn start(
        broker: Arc<dyn Broker>,
        options: BridgeOptions,
        fanout: FanoutQueue,
        cancel: CancellationToken,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        // Bounded so a broker outage cannot grow memory without limit
        let (publish_tx, publish_rx) = mpsc::channel(options.publish_queue_capacity.max(1));

        info!(
            channel = %options.channel,
            node_id = %options.node_id,
            delivery_mode = ?options.delivery_mode,
            "Starting relay bridge"
        );

        let bridge = Arc::new(Self {
            broker,
            options,
            fanout,
            publish_tx,
            subscribed: AtomicBool::new(false),
            counters: Counters::default(),
            cancel,
        });

        let publisher = tokio::spawn(bridge.clone().run_publisher(publish_rx));
        let subscriber = tokio::spawn(bridge.clone().run_subscriber_loop());

        (bridge, vec![publisher, subscriber])
    }

    /// Hand a locally read payload to the publisher task.
    ///
    /// Never waits on the broker. A full publish queue drops the payload.
    pub fn publish(&self, payload: Payload) -> Result<()> {
        self.publish_tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(payload) => {
                self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = %self.options.channel,
                    bytes = payload.len(),
                    "Publish queue full, dropping payload"
                );
                Error::QueueFull(self.options.publish_queue_capacity)
            }
            TrySendError::Closed(_) => Error::QueueClosed,
        })
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.options.channel
    }

    #[must_use]
    pub const fn delivery_mode(&self) -> DeliveryMode {
        self.options.delivery_mode
    }

    #[must_use]
    pub fn metrics(&self) -> BridgeMetrics {
        let c = &self.counters;
        BridgeMetrics {
            published: c.published.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            publish_dropped: c.publish_dropped.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            dropped_own: c.dropped_own.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            raw_forwarded: c.raw_forwarded.load(Ordering::Relaxed),
            fanout_dropped: c.fanout_dropped.load(Ordering::Relaxed),
        }
    }

    async fn run_publisher(self: Arc<Self>, mut rx: mpsc::Receiver<Payload>) {
        loop {
            let payload = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("Relay publisher task cancelled");
                    return;
                }
                payload = rx.recv() => payload,
            };

            match payload {
                Some(payload) => self.publish_now(&payload).await,
                None => {
                    debug!("Publish channel closed, publisher exiting");
                    return;
                }
            }
        }
    }

    async fn publish_now(&self, payload: &Payload) {
        let frame = match RelayFrame::new(&self.options.node_id, payload).encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Failed to encode relay frame");
                return;
            }
        };

        let result = match timeout(
            self.options.op_timeout,
            self.broker.publish(&self.options.channel, frame),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::BrokerPublish("Timed out publishing".to_string())),
        };

        match result {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %self.options.channel,
                    bytes = payload.len(),
                    "Payload published to broker"
                );
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    channel = %self.options.channel,
                    "Failed to publish payload, cross-node delivery degraded"
                );
            }
        }
    }

    async fn run_subscriber_loop(self: Arc<Self>) {
        let mut backoff = self.options.initial_backoff;

        loop {
            if self.cancel.is_cancelled() {
                info!("Relay subscriber task cancelled");
                return;
            }

            match self.run_subscriber().await {
                SubscriberExit::Cancelled => {
                    info!("Relay subscriber task cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    // The broker was reachable, so start over from the shortest delay
                    backoff = self.options.initial_backoff;
                    error!(
                        backoff_ms = backoff.as_millis() as u64,
                        "Broker subscription lost, resubscribing"
                    );
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to subscribe to broker, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Relay subscriber task cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(self.options.max_backoff);
        }
    }

    async fn run_subscriber(&self) -> SubscriberExit {
        let subscribe = timeout(
            self.options.op_timeout,
            self.broker.subscribe(&self.options.channel),
        );
        let mut stream = tokio::select! {
            () = self.cancel.cancelled() => return SubscriberExit::Cancelled,
            result = subscribe => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return SubscriberExit::ConnectFailed(e),
                Err(_) => {
                    return SubscriberExit::ConnectFailed(Error::BrokerSubscribe(
                        "Timed out subscribing".to_string(),
                    ));
                }
            },
        };

        self.subscribed.store(true, Ordering::SeqCst);
        info!(channel = %self.options.channel, "Relay subscriber listening");

        let exit = loop {
            let raw = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break SubscriberExit::Cancelled,
                raw = stream.next() => raw,
            };

            match raw {
                Some(raw) => self.dispatch(&raw),
                None => break SubscriberExit::Disconnected,
            }
        };

        self.subscribed.store(false, Ordering::SeqCst);
        exit
    }

    /// Decode one broker frame and queue it for local fan-out
    fn dispatch(&self, raw: &[u8]) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        // Publishers that don't speak the frame format send bare payloads
        let frame = match RelayFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.raw_forwarded.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, bytes = raw.len(), "Relaying non-frame broker message as-is");
                self.enqueue(raw_payload(raw), "unknown");
                return;
            }
        };

        if self.options.delivery_mode == DeliveryMode::LocalFirst && frame.node_id == self.options.node_id {
            self.counters.dropped_own.fetch_add(1, Ordering::Relaxed);
            debug!("Ignoring frame from self (already delivered locally)");
            return;
        }

        let node_id = frame.node_id.clone();
        let payload = match frame.into_payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, node_id = %node_id, "Relay frame carried invalid data");
                return;
            }
        };

        self.enqueue(payload, &node_id);
    }

    fn enqueue(&self, payload: Payload, node_id: &str) {
        if let Err(e) = self.fanout.enqueue(payload) {
            self.counters.fanout_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, node_id = %node_id, "Failed to queue relayed payload");
        }
    }
}

/// Bare broker message: text when it is valid UTF-8, binary otherwise
fn raw_payload(raw: &[u8]) -> Payload {
    match std::str::from_utf8(raw) {
        Ok(text) => Payload::text(text),
        Err(_) => Payload::binary(Bytes::copy_from_slice(raw)),
    }
}

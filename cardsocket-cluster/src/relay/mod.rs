// Module: relay

pub mod bridge;
pub mod broker;
pub mod connection;
pub mod envelope;
pub mod fanout;
pub mod manager;
pub mod registry;

pub use bridge::{BridgeMetrics, BridgeOptions, RelayBridge, RelayFrame};
pub use broker::{Broker, MemoryBroker, PayloadStream, RedisBroker};
pub use connection::{Connection, ConnectionId, ConnectionRef, Payload, PayloadKind};
pub use envelope::MessageEnvelope;
pub use fanout::{FanoutQueue, FanoutReceiver, FanoutWorker};
pub use manager::{Relay, RelayOptions};
pub use registry::{BroadcastReport, ConnectionRegistry, RegistryMetrics};

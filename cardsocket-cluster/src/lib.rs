pub mod error;
pub mod relay;

#[cfg(test)]
pub mod test_helpers;

pub use error::{Error, Result};
pub use relay::{
    Broker, Connection, ConnectionId, ConnectionRef, ConnectionRegistry, FanoutQueue,
    MemoryBroker, MessageEnvelope, Payload, PayloadKind, RedisBroker, Relay, RelayBridge,
    RelayOptions,
};

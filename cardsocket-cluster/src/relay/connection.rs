use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

/// Frame kind a payload arrived with, preserved end to end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    Binary,
}

/// An opaque relayed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: PayloadKind,
    pub data: Bytes,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            data: Bytes::from(text.into()),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadKind::Binary,
            data: data.into(),
        }
    }

    /// The payload as UTF-8, if it is a text frame holding valid UTF-8
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            PayloadKind::Text => std::str::from_utf8(&self.data).ok(),
            PayloadKind::Binary => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Identifies one physical connection, independent of the client identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid::nanoid!(16))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An open duplex endpoint the registry can write to and close.
///
/// `close` must be idempotent: only the first call has an effect and returns
/// `true`. After it, `send` fails with `Error::ConnectionClosed` and the
/// owning receive loop is expected to wind down.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    async fn send(&self, payload: Payload) -> Result<()>;

    fn close(&self) -> bool;

    fn is_closed(&self) -> bool;
}

/// Shared handle stored in the registry
pub type ConnectionRef = Arc<dyn Connection>;

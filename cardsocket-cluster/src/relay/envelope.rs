use serde::{Deserialize, Serialize};

use super::connection::Payload;
use crate::error::{Error, Result};

/// Application-level addressed message.
///
/// Clients may put these on the wire, but the relay never looks inside a
/// payload: every frame is broadcast as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub recipient_id: String,
    pub sender_id: String,
    pub content: String,
}

impl MessageEnvelope {
    pub fn new(
        recipient_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode as a text frame
    pub fn to_payload(&self) -> Result<Payload> {
        Ok(Payload::text(self.to_json()?))
    }

    /// Parse a payload, accepting either frame kind as long as it holds JSON
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        serde_json::from_slice(&payload.data)
            .map_err(|e| Error::Codec(format!("Not a message envelope: {e}")))
    }
}

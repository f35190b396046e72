//! Protocol message definitions
//!
//! Frames are JSON text with a `type` discriminator. Outbound commands carry
//! nothing else; inbound messages carry an opaque payload next to `type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────

/// Command type sent by the heartbeat loop
pub const HEARTBEAT_COMMAND: &str = "Heartbeat";

/// A command frame: `{"type": <string>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCommand {
    #[serde(rename = "type")]
    pub command_type: String,
}

impl OutboundCommand {
    /// Create a command of the given type
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
        }
    }

    /// The keepalive command
    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_COMMAND)
    }

    /// Serialize to the wire representation
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────

/// Inbound message types the client knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    /// Handshake acknowledgment
    Connected,
    /// Keepalive acknowledgment
    HeartbeatAck,
    /// Node status changed on the server side
    NodeUpdate,
    /// Points balance changed
    PointsUpdate,
}

impl InboundKind {
    /// All recognized kinds
    pub fn all() -> &'static [InboundKind] {
        &[
            InboundKind::Connected,
            InboundKind::HeartbeatAck,
            InboundKind::NodeUpdate,
            InboundKind::PointsUpdate,
        ]
    }

    /// Wire name of this kind
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundKind::Connected => "connected",
            InboundKind::HeartbeatAck => "heartbeat_ack",
            InboundKind::NodeUpdate => "NodeUpdate",
            InboundKind::PointsUpdate => "PointsUpdate",
        }
    }

    /// Look up a wire name; unknown names are `None`
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.type_name() == name)
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Value of the required `type` field
    pub message_type: String,

    /// Every other field, untouched
    pub payload: Map<String, Value>,
}

impl InboundMessage {
    /// Decode a text frame.
    ///
    /// Fails when the frame is not a JSON object or `type` is missing or not a
    /// string.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::decode(format!("invalid JSON: {}", e)))?;

        let Value::Object(mut payload) = value else {
            return Err(Error::decode("frame is not a JSON object"));
        };

        let message_type = match payload.remove("type") {
            Some(Value::String(t)) => t,
            Some(other) => {
                return Err(Error::decode(format!("`type` is not a string: {}", other)));
            }
            None => return Err(Error::decode("missing `type` field")),
        };

        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Decode a binary frame holding UTF-8 JSON
    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::decode(format!("binary frame is not UTF-8: {}", e)))?;
        Self::from_json(text)
    }

    /// Recognized kind, if any
    pub fn kind(&self) -> Option<InboundKind> {
        InboundKind::from_type_name(&self.message_type)
    }
}

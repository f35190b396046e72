//! Inbound message dispatch
//!
//! Frames are decoded and routed by their `type` field to a registered
//! handler. Frames that cannot be decoded are dropped and logged; they never
//! end the session. Unknown types are logged and ignored.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{InboundKind, InboundMessage};

/// Handles one inbound message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> Result<()> + Send + Sync,
{
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        self(message)
    }
}

/// Default handler: records the message in the log
#[derive(Debug, Clone, Copy)]
pub struct LogHandler {
    kind: InboundKind,
}

impl LogHandler {
    pub fn new(kind: InboundKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        match self.kind {
            InboundKind::Connected => info!("Node connection acknowledged"),
            InboundKind::HeartbeatAck => debug!("Heartbeat acknowledged"),
            InboundKind::NodeUpdate => {
                info!(payload = %serde_json::Value::Object(message.payload.clone()), "Node update")
            }
            InboundKind::PointsUpdate => {
                info!(payload = %serde_json::Value::Object(message.payload.clone()), "Points update")
            }
        }
        Ok(())
    }
}

/// What became of one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Routed to the handler for this type
    Handled(String),
    /// Decoded, but nothing is registered for this type
    Unhandled(String),
    /// Could not be decoded, or the handler failed
    Dropped(String),
}

/// Running totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: u64,
    pub unhandled: u64,
    pub dropped: u64,
}

/// Routes decoded messages by type
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    stats: DispatchStats,
}

impl MessageDispatcher {
    /// Dispatcher with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with a `LogHandler` for every known message type
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        for kind in InboundKind::all() {
            dispatcher.register(kind.type_name(), LogHandler::new(*kind));
        }
        dispatcher
    }

    /// Register a handler, returning the one it replaces
    pub fn register(
        &mut self,
        message_type: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(message_type.into(), Arc::new(handler))
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Decode and dispatch one text frame
    pub async fn dispatch(&mut self, frame: &str) -> DispatchOutcome {
        match InboundMessage::from_json(frame) {
            Ok(message) => self.dispatch_message(&message).await,
            Err(e) => self.drop_frame(e, preview(frame)),
        }
    }

    /// Decode and dispatch one binary frame carrying UTF-8 JSON
    pub async fn dispatch_bytes(&mut self, frame: &[u8]) -> DispatchOutcome {
        match InboundMessage::from_json_bytes(frame) {
            Ok(message) => self.dispatch_message(&message).await,
            Err(e) => self.drop_frame(e, preview(&String::from_utf8_lossy(frame))),
        }
    }

    /// Dispatch an already decoded message
    pub async fn dispatch_message(&mut self, message: &InboundMessage) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&message.message_type).cloned() else {
            debug!(
                message_type = %message.message_type,
                known = message.kind().is_some(),
                "No handler for message type"
            );
            self.stats.unhandled += 1;
            return DispatchOutcome::Unhandled(message.message_type.clone());
        };

        match handler.handle(message).await {
            Ok(()) => {
                self.stats.handled += 1;
                DispatchOutcome::Handled(message.message_type.clone())
            }
            Err(e) => {
                warn!(message_type = %message.message_type, error = %e, "Handler failed");
                self.stats.dropped += 1;
                DispatchOutcome::Dropped(e.to_string())
            }
        }
    }

    fn drop_frame(&mut self, err: Error, frame: String) -> DispatchOutcome {
        warn!(error = %err, frame = %frame, "Dropping undecodable frame");
        self.stats.dropped += 1;
        DispatchOutcome::Dropped(err.to_string())
    }
}

/// First 120 characters of a frame, for logging
fn preview(frame: &str) -> String {
    const LIMIT: usize = 120;
    if frame.chars().count() <= LIMIT {
        frame.to_string()
    } else {
        let head: String = frame.chars().take(LIMIT).collect();
        format!("{}...", head)
    }
}

//! Live sessions and the command sender
//!
//! A `Session` owns the read half of one transport connection. Its write half
//! lives in a cloneable `SessionWriter` so the heartbeat task and external
//! callers can send while the manager reads. `CommandSender` is the public
//! entry point for outbound commands and always targets the current session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::transport::{FrameSink, FrameStream};
use crate::error::{Error, Result};
use crate::protocol::OutboundCommand;

/// Upper bound on a graceful close so teardown never hangs on a dead peer
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────
// Session Writer
// ─────────────────────────────────────────────────────────────────

/// Shared write half of one session
#[derive(Clone)]
pub struct SessionWriter {
    session_id: Uuid,
    sink: Arc<Mutex<FrameSink>>,
    open: Arc<AtomicBool>,
}

impl SessionWriter {
    fn new(session_id: Uuid, sink: FrameSink) -> Self {
        Self {
            session_id,
            sink: Arc::new(Mutex::new(sink)),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether the session still accepts frames
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Send one text frame
    pub async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        let mut sink = self.sink.lock().await;
        // Closed while we waited for the lock
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        sink.send(WsMessage::Text(text)).await.map_err(|e| {
            if matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed) {
                self.open.store(false, Ordering::Release);
            }
            Error::from(e)
        })
    }

    /// Mark closed and send a close frame. Safe to call more than once.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let closing = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            debug!(session = %self.session_id, "Close handshake timed out");
        }
    }
}

impl std::fmt::Debug for SessionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWriter")
            .field("session_id", &self.session_id)
            .field("open", &self.is_open())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────

/// One established transport connection
pub struct Session {
    id: Uuid,
    writer: SessionWriter,
    reader: FrameStream,
    opened_at: Instant,
}

impl Session {
    /// Wrap the two halves produced by a transport handshake
    pub fn new(sink: FrameSink, reader: FrameStream) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            writer: SessionWriter::new(id, sink),
            reader,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn writer(&self) -> SessionWriter {
        self.writer.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Next inbound frame; `None` once the peer is gone
    pub async fn next_frame(&mut self) -> Option<std::result::Result<WsMessage, WsError>> {
        self.reader.next().await
    }

    pub async fn close(&self) {
        self.writer.close().await;
    }
}

// ─────────────────────────────────────────────────────────────────
// Command Sender
// ─────────────────────────────────────────────────────────────────

/// Sends `{"type": ...}` commands over whichever session is current
#[derive(Clone, Default)]
pub struct CommandSender {
    current: Arc<RwLock<Option<SessionWriter>>>,
}

impl CommandSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sender fixed to one session; it never follows a reconnect
    pub fn pinned(writer: SessionWriter) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(writer))),
        }
    }

    /// Whether a send right now would reach an open session
    pub fn is_connected(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|w| w.is_open())
            .unwrap_or(false)
    }

    /// Send a command frame.
    ///
    /// Fails with `NotConnected` when no session is open. Transport failures
    /// are returned as-is; detecting the dead session is the reader's job.
    pub async fn send(&self, command_type: &str) -> Result<()> {
        // Clone out so the lock is not held across the await
        let writer = self
            .current
            .read()
            .clone()
            .filter(|w| w.is_open())
            .ok_or(Error::NotConnected)?;

        let frame = OutboundCommand::new(command_type).to_json()?;
        match writer.send_text(frame).await {
            Ok(()) => {
                debug!(command = command_type, session = %writer.session_id(), "Sent command");
                Ok(())
            }
            Err(e) => {
                warn!(command = command_type, error = %e, "Failed to send command");
                Err(e)
            }
        }
    }

    pub(crate) fn attach(&self, writer: SessionWriter) {
        *self.current.write() = Some(writer);
    }

    pub(crate) fn detach(&self) -> Option<SessionWriter> {
        self.current.write().take()
    }
}

impl std::fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender")
            .field("connected", &self.is_connected())
            .finish()
    }
}

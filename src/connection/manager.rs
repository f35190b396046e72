//! Connection manager
//!
//! Owns the connection lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected -> (backoff) -> Connecting ...
//!                   \-> Disconnected (handshake failed)
//! Disconnected -> Failed (attempt budget spent, terminal)
//! ```
//!
//! Every status change is written to the state store before the manager does
//! anything else, so an observer of the store never sees a stale status.
//! Only one session exists at a time; the previous one is fully torn down
//! (heartbeat stopped, transport closed) before the next handshake starts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{ConnectionSettings, NodeConfig};
use crate::connection::dispatcher::MessageDispatcher;
use crate::connection::heartbeat::{HeartbeatHandle, HeartbeatLoop};
use crate::connection::policy::{ReconnectDecision, ReconnectPolicy};
use crate::connection::session::{CommandSender, Session};
use crate::connection::transport::{endpoint_url, redacted, Transport, WsTransport};
use crate::error::{Error, Result};
use crate::state::{StateStore, KEY_LAST_DISCONNECTED, KEY_STATUS};

pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_CONNECTED: &str = "Connected successfully!";
pub const STATUS_DISCONNECTED: &str = "Disconnected";

/// Failure reasons are cut to this many characters before they are stored
const MAX_REASON_CHARS: usize = 200;

// ─────────────────────────────────────────────────────────────────
// State and Events
// ─────────────────────────────────────────────────────────────────

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Idle,
    /// Handshake in progress
    Connecting,
    /// Session live, heartbeat running
    Connected,
    /// No session; a retry may follow
    Disconnected,
    /// Attempt budget spent; nothing further happens
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Events emitted to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Status persisted
    StatusChanged {
        state: ConnectionState,
        status: String,
    },

    /// Session established
    Connected { session_id: Uuid },

    /// Live session ended
    Disconnected { reason: String },

    /// Waiting before the next attempt
    Reconnecting { attempt: u32, delay: Duration },

    /// Gave up
    Failed { attempts: u32 },
}

/// Why `run` returned without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown was requested through a `ShutdownHandle`
    Shutdown,
}

/// Requests a graceful stop of a running manager
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum SessionEnd {
    Lost(Error),
    Shutdown,
}

struct ActiveSession {
    session: Session,
    heartbeat: HeartbeatHandle,
}

// ─────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────

/// Drives connect, keepalive, dispatch and reconnect for one node
pub struct ConnectionManager {
    settings: ConnectionSettings,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    store: Box<dyn StateStore>,
    dispatcher: MessageDispatcher,
    state: ConnectionState,
    attempts: u32,
    active: Option<ActiveSession>,
    sender: CommandSender,
    shutdown: CancellationToken,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl ConnectionManager {
    /// Create a manager; known message types get logging handlers
    pub fn new(
        settings: ConnectionSettings,
        policy: ReconnectPolicy,
        transport: Arc<dyn Transport>,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self {
            settings,
            policy,
            transport,
            store,
            dispatcher: MessageDispatcher::with_defaults(),
            state: ConnectionState::Idle,
            attempts: 0,
            active: None,
            sender: CommandSender::new(),
            shutdown: CancellationToken::new(),
            events: None,
        }
    }

    /// Manager over the WebSocket transport described by `config`
    pub fn from_config(config: &NodeConfig, store: Box<dyn StateStore>) -> Self {
        Self::new(
            config.connection.clone(),
            ReconnectPolicy::from_settings(&config.reconnect),
            Arc::new(WsTransport::new(&config.connection)),
            store,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful session
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn dispatcher_mut(&mut self) -> &mut MessageDispatcher {
        &mut self.dispatcher
    }

    /// Sender that follows whichever session is current
    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Receive lifecycle events. A new subscription replaces the previous one.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Send `{"type": command_type}` over the current session
    pub async fn send_command(&self, command_type: &str) -> Result<()> {
        self.sender.send(command_type).await
    }

    /// Connect and keep the session alive until shutdown or the attempt
    /// budget is spent.
    ///
    /// Returns `RetryExhausted` after the final failed attempt, leaving the
    /// manager in `Failed`. Handshake and session errors never escape; they
    /// only feed the reconnect policy.
    pub async fn run(&mut self, token: &str) -> Result<RunOutcome> {
        if self.state == ConnectionState::Failed {
            return Err(Error::RetryExhausted {
                attempts: self.attempts,
            });
        }

        let url = endpoint_url(&self.settings.url_template, token)?;
        info!(
            url = %redacted(&url),
            max_attempts = self.policy.max_attempts(),
            heartbeat_ms = self.settings.heartbeat_interval_ms,
            "Starting connection manager"
        );

        loop {
            let reason = match self.connect_once(&url).await {
                None => return Ok(self.finish_shutdown().await),
                Some(Ok(session)) => {
                    self.on_open(session);
                    match self.receive().await {
                        SessionEnd::Shutdown => return Ok(self.finish_shutdown().await),
                        SessionEnd::Lost(err) => {
                            self.on_session_lost(&err).await;
                            err.to_string()
                        }
                    }
                }
                Some(Err(e)) => {
                    self.on_handshake_failed(&e);
                    e.to_string()
                }
            };

            self.attempts += 1;
            match self.policy.decide(self.attempts) {
                ReconnectDecision::Retry { attempt, delay } => {
                    info!(
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        reason = %truncate_reason(&reason),
                        "Reconnecting"
                    );
                    self.emit(ConnectionEvent::Reconnecting { attempt, delay });

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(self.finish_shutdown().await),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ReconnectDecision::GiveUp { attempts } => {
                    self.enter_failed(attempts);
                    return Err(Error::RetryExhausted { attempts });
                }
            }
        }
    }

    /// Close the current session, if any. Idempotent; `Failed` stays `Failed`.
    pub async fn disconnect(&mut self) {
        let had_session = self.teardown().await;

        match self.state {
            ConnectionState::Failed => {}
            ConnectionState::Disconnected if !had_session => {}
            _ => self.mark_disconnected(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────

    /// Tear down, enter `Connecting`, then handshake. `None` on shutdown.
    async fn connect_once(&mut self, url: &Url) -> Option<Result<Session>> {
        self.teardown().await;
        self.transition(ConnectionState::Connecting, STATUS_CONNECTING.to_string());
        info!(
            url = %redacted(url),
            attempt = self.attempts + 1,
            "Connecting to node endpoint"
        );

        let transport = self.transport.clone();
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            result = transport.connect(url) => {
                Some(result.map(|(sink, stream)| Session::new(sink, stream)))
            }
        }
    }

    fn on_open(&mut self, session: Session) {
        self.attempts = 0;
        self.transition(ConnectionState::Connected, STATUS_CONNECTED.to_string());

        let writer = session.writer();
        self.sender.attach(writer.clone());
        let heartbeat = HeartbeatLoop::new(
            CommandSender::pinned(writer),
            self.settings.heartbeat_interval(),
            &self.shutdown,
        )
        .spawn();

        let session_id = session.id();
        info!(session = %session_id, "Connected to node endpoint");
        self.emit(ConnectionEvent::Connected { session_id });
        self.active = Some(ActiveSession { session, heartbeat });
    }

    // lastDisconnected is left alone: it marks the end of a live session
    fn on_handshake_failed(&mut self, err: &Error) {
        error!(error = %err.format_for_log(), "Connection attempt failed");
        self.transition(
            ConnectionState::Disconnected,
            format!("Connection failed: {}", truncate_reason(&err.to_string())),
        );
    }

    async fn on_session_lost(&mut self, err: &Error) {
        warn!(error = %err.format_for_log(), "Session ended");
        self.teardown().await;
        self.mark_disconnected();
        self.emit(ConnectionEvent::Disconnected {
            reason: truncate_reason(&err.to_string()),
        });
    }

    fn enter_failed(&mut self, attempts: u32) {
        error!(attempts, "Reconnect limit reached, giving up");
        self.transition(
            ConnectionState::Failed,
            format!("Failed: reconnect limit reached after {} attempts", attempts),
        );
        self.emit(ConnectionEvent::Failed { attempts });
    }

    async fn finish_shutdown(&mut self) -> RunOutcome {
        info!("Shutdown requested, closing connection");
        self.disconnect().await;
        RunOutcome::Shutdown
    }

    fn mark_disconnected(&mut self) {
        self.transition(ConnectionState::Disconnected, STATUS_DISCONNECTED.to_string());
        let now = Utc::now().to_rfc3339();
        self.persist(KEY_LAST_DISCONNECTED, &now);
    }

    fn transition(&mut self, state: ConnectionState, status: String) {
        let previous = self.state;
        self.state = state;
        self.persist(KEY_STATUS, &status);
        info!(from = %previous, to = %state, "[STATUS] {}", status);
        self.emit(ConnectionEvent::StatusChanged { state, status });
    }

    fn persist(&mut self, key: &str, value: &str) {
        if let Err(e) = self.store.set(key, value) {
            error!(key, error = %e, "Failed to persist connection state");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────

    /// Read frames until the session ends or shutdown is requested
    async fn receive(&mut self) -> SessionEnd {
        loop {
            let Some(active) = self.active.as_mut() else {
                return SessionEnd::Lost(Error::connection_lost("no active session"));
            };

            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                frame = active.session.next_frame() => frame,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    self.dispatcher.dispatch(&text).await;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    self.dispatcher.dispatch_bytes(&data).await;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = match frame {
                        Some(f) if !f.reason.is_empty() => {
                            format!("closed by server: {} {}", f.code, f.reason)
                        }
                        Some(f) => format!("closed by server: {}", f.code),
                        None => "closed by server".to_string(),
                    };
                    return SessionEnd::Lost(Error::connection_lost(reason));
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by the transport
                }
                Some(Err(e)) => return SessionEnd::Lost(Error::connection_lost(e.to_string())),
                None => return SessionEnd::Lost(Error::connection_lost("connection closed")),
            }
        }
    }

    /// Stop the heartbeat and close the transport. `false` when idle.
    async fn teardown(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };

        self.sender.detach();
        let sent = active.heartbeat.stop().await;
        // Close through the writer; the read half is not Sync
        let writer = active.session.writer();
        writer.close().await;
        debug!(
            session = %active.session.id(),
            heartbeats = sent,
            uptime_secs = active.session.uptime().as_secs(),
            "Session torn down"
        );
        true
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.chars().count() <= MAX_REASON_CHARS {
        reason.to_string()
    } else {
        reason.chars().take(MAX_REASON_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{MemoryPeer, ScriptedTransport};
    use crate::protocol::InboundMessage;
    use crate::state::MemoryStore;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
    use tokio_tungstenite::tungstenite::Error as WsError;

    /// Store shared with the test that also records every write in order
    #[derive(Clone, Default)]
    struct SharedStore {
        inner: Arc<Mutex<MemoryStore>>,
        writes: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl SharedStore {
        fn statuses(&self) -> Vec<String> {
            self.writes
                .lock()
                .iter()
                .filter(|(k, _)| k == KEY_STATUS)
                .map(|(_, v)| v.clone())
                .collect()
        }
    }

    impl StateStore for SharedStore {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.lock().get(key)
        }

        fn set(&mut self, key: &str, value: &str) -> Result<()> {
            self.writes.lock().push((key.to_string(), value.to_string()));
            self.inner.lock().set(key, value)
        }

        fn remove(&mut self, key: &str) -> Result<()> {
            self.inner.lock().remove(key)
        }

        fn snapshot(&self) -> BTreeMap<String, String> {
            self.inner.lock().snapshot()
        }
    }

    fn manager(
        transport: &Arc<ScriptedTransport>,
        store: &SharedStore,
        base_ms: u64,
        max_attempts: u32,
    ) -> ConnectionManager {
        let settings = ConnectionSettings {
            url_template: "ws://memory.test/ws/node?token={token}".to_string(),
            heartbeat_interval_ms: 20,
            ..Default::default()
        };
        let policy = ReconnectPolicy::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(base_ms * 30),
            max_attempts,
        );
        ConnectionManager::new(settings, policy, transport.clone(), Box::new(store.clone()))
    }

    fn spawn_run(
        mut manager: ConnectionManager,
    ) -> JoinHandle<(ConnectionManager, Result<RunOutcome>)> {
        tokio::spawn(async move {
            let result = manager.run("abc123").await;
            (manager, result)
        })
    }

    async fn wait_for<F>(
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        seen: &mut Vec<ConnectionEvent>,
        mut pred: F,
    ) -> ConnectionEvent
    where
        F: FnMut(&ConnectionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("event channel open");
                seen.push(event.clone());
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event within two seconds")
    }

    fn reconnect_delays(events: &[ConnectionEvent]) -> Vec<Duration> {
        events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Reconnecting { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    async fn next_text(peer: &mut MemoryPeer) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(2), peer.next_outbound())
            .await
            .expect("frame within two seconds")
            .expect("session open");
        match frame {
            WsMessage::Text(text) => text,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_attempt_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 5);
        let mut events = mgr.subscribe();

        let err = mgr.run("abc123").await.unwrap_err();

        assert!(matches!(err, Error::RetryExhausted { attempts: 5 }));
        assert_eq!(transport.calls(), 5);
        assert_eq!(mgr.state(), ConnectionState::Failed);
        assert_eq!(
            store.get(KEY_STATUS).as_deref(),
            Some("Failed: reconnect limit reached after 5 attempts")
        );

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            reconnect_delays(&seen),
            vec![
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(8),
                Duration::from_millis(16),
            ]
        );
        assert_eq!(seen.last(), Some(&ConnectionEvent::Failed { attempts: 5 }));

        let statuses = store.statuses();
        assert_eq!(statuses.iter().filter(|s| *s == STATUS_CONNECTING).count(), 5);
        assert_eq!(
            statuses
                .iter()
                .filter(|s| s.starts_with("Connection failed: "))
                .count(),
            5
        );
    }

    #[tokio::test]
    async fn test_failed_is_terminal() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 2);

        assert!(mgr.run("abc123").await.is_err());
        assert_eq!(transport.calls(), 2);

        let again = mgr.run("abc123").await;
        assert!(matches!(again, Err(Error::RetryExhausted { attempts: 2 })));
        assert_eq!(transport.calls(), 2);

        mgr.disconnect().await;
        assert_eq!(mgr.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail("refused");
        transport.fail("refused");
        transport.fail("refused");
        let mut peer = transport.accept();

        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 5);
        let mut events = mgr.subscribe();
        let shutdown = mgr.shutdown_handle();
        let running = spawn_run(mgr);

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;

        assert_eq!(
            reconnect_delays(&seen),
            vec![
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(8),
            ]
        );

        // Status is durable before the first heartbeat goes out
        assert_eq!(next_text(&mut peer).await, r#"{"type":"Heartbeat"}"#);
        let refused = "Connection failed: Handshake with ws://memory failed: refused";
        assert_eq!(
            store.statuses(),
            vec![
                STATUS_CONNECTING,
                refused,
                STATUS_CONNECTING,
                refused,
                STATUS_CONNECTING,
                refused,
                STATUS_CONNECTING,
                STATUS_CONNECTED,
            ]
        );
        // No live session has ended yet
        assert!(store.get(KEY_LAST_DISCONNECTED).is_none());

        shutdown.shutdown();
        let (mgr, result) = running.await.unwrap();

        assert_eq!(result.unwrap(), RunOutcome::Shutdown);
        assert_eq!(mgr.attempts(), 0);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(store.get(KEY_STATUS).as_deref(), Some(STATUS_DISCONNECTED));
        assert!(store.get(KEY_LAST_DISCONNECTED).is_some());
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_url_carries_token() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 1);

        let _ = mgr.run("abc123").await;

        assert_eq!(
            transport.urls(),
            vec!["ws://memory.test/ws/node?token=abc123".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected_before_connecting() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 5);

        let err = mgr.run("").await.unwrap_err();

        assert!(matches!(err, Error::InvalidToken(_)));
        assert_eq!(transport.calls(), 0);
        assert_eq!(mgr.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_bad_frame_does_not_end_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let peer = transport.accept();

        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 5);
        let (tx, mut points) = mpsc::unbounded_channel();
        mgr.dispatcher_mut()
            .register("PointsUpdate", move |msg: &InboundMessage| -> Result<()> {
                let _ = tx.send(msg.payload.clone());
                Ok(())
            });
        let mut events = mgr.subscribe();
        let sender = mgr.sender();
        let shutdown = mgr.shutdown_handle();
        let running = spawn_run(mgr);

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;

        peer.send_text("not json");
        peer.send_text(r#"{"type":"PointsUpdate","value":10}"#);

        let payload = tokio::time::timeout(Duration::from_secs(2), points.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["value"], 10);
        assert!(sender.is_connected());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ConnectionEvent::Disconnected { .. }));
        }

        shutdown.shutdown();
        let (_, result) = running.await.unwrap();
        assert_eq!(result.unwrap(), RunOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_session_loss_reconnects_with_fresh_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let first = transport.accept();
        let mut second = transport.accept();

        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 5);
        let mut events = mgr.subscribe();
        let sender = mgr.sender();
        let shutdown = mgr.shutdown_handle();
        let running = spawn_run(mgr);

        let mut seen = Vec::new();
        let first_id = match wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await
        {
            ConnectionEvent::Connected { session_id } => session_id,
            other => panic!("unexpected event: {:?}", other),
        };

        drop(first);

        let reconnected = wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;
        assert_ne!(reconnected, ConnectionEvent::Connected { session_id: first_id });
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Disconnected { .. })));
        assert_eq!(reconnect_delays(&seen), vec![Duration::from_millis(2)]);
        assert!(store.get(KEY_LAST_DISCONNECTED).is_some());

        sender.send("NodeStatus").await.unwrap();
        loop {
            if next_text(&mut second).await == r#"{"type":"NodeStatus"}"# {
                break;
            }
        }

        shutdown.shutdown();
        let (mgr, result) = running.await.unwrap();
        assert_eq!(result.unwrap(), RunOutcome::Shutdown);
        assert_eq!(mgr.attempts(), 0);
    }

    #[tokio::test]
    async fn test_server_close_frame_ends_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let peer = transport.accept();

        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 1);
        let mut events = mgr.subscribe();
        let running = spawn_run(mgr);

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;

        peer.send_frame(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "maintenance".into(),
        })));

        let event = wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Disconnected { .. })
        })
        .await;
        let ConnectionEvent::Disconnected { reason } = event else {
            unreachable!()
        };
        assert!(reason.contains("maintenance"));

        // One attempt allowed: losing the session spends it
        let (mgr, result) = running.await.unwrap();
        assert!(matches!(result, Err(Error::RetryExhausted { attempts: 1 })));
        assert_eq!(mgr.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_read_error_is_connection_lost() {
        let transport = Arc::new(ScriptedTransport::new());
        let peer = transport.accept();

        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 1);
        let (tx, mut points) = mpsc::unbounded_channel();
        mgr.dispatcher_mut()
            .register("PointsUpdate", move |msg: &InboundMessage| -> Result<()> {
                let _ = tx.send(msg.payload.clone());
                Ok(())
            });
        let mut events = mgr.subscribe();
        let running = spawn_run(mgr);

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;

        // Binary JSON reaches the handler; junk bytes do not end the session
        peer.send_frame(WsMessage::Binary(vec![0xff, 0x00]));
        peer.send_frame(WsMessage::Binary(
            br#"{"type":"PointsUpdate","value":7}"#.to_vec(),
        ));
        let payload = tokio::time::timeout(Duration::from_secs(2), points.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["value"], 7);

        peer.send_error(WsError::ConnectionClosed);

        let event = wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Disconnected { .. })
        })
        .await;
        match event {
            ConnectionEvent::Disconnected { reason } => {
                assert!(reason.starts_with("Connection lost: "), "{}", reason)
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let (_, result) = running.await.unwrap();
        assert!(matches!(result, Err(Error::RetryExhausted { attempts: 1 })));
        assert!(store.get(KEY_LAST_DISCONNECTED).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 10_000, 5);
        let mut events = mgr.subscribe();
        let shutdown = mgr.shutdown_handle();
        let running = spawn_run(mgr);

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Reconnecting { .. })
        })
        .await;
        shutdown.shutdown();

        let (mgr, result) = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("run returns promptly")
            .unwrap();
        assert_eq!(result.unwrap(), RunOutcome::Shutdown);
        assert_eq!(transport.calls(), 1);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(store
            .get(KEY_STATUS)
            .unwrap()
            .starts_with("Connection failed: "));
    }

    #[tokio::test]
    async fn test_send_command_without_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = SharedStore::default();
        let mgr = manager(&transport, &store, 1, 5);

        let err = mgr.send_command("Heartbeat").await.unwrap_err();

        assert!(matches!(err, Error::NotConnected));
        assert_eq!(err.to_string(), "WebSocket not connected");
        assert_eq!(mgr.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut peer = transport.accept();

        let store = SharedStore::default();
        let mut mgr = manager(&transport, &store, 1, 5);
        let mut events = mgr.subscribe();
        let shutdown = mgr.shutdown_handle();
        let running = spawn_run(mgr);

        let mut seen = Vec::new();
        wait_for(&mut events, &mut seen, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;
        shutdown.shutdown();
        let (mut mgr, _) = running.await.unwrap();

        let disconnects = |store: &SharedStore| {
            store
                .statuses()
                .iter()
                .filter(|s| *s == STATUS_DISCONNECTED)
                .count()
        };
        assert_eq!(disconnects(&store), 1);

        mgr.disconnect().await;
        mgr.disconnect().await;
        assert_eq!(disconnects(&store), 1);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        // Client closed the transport
        loop {
            match peer.next_outbound().await {
                Some(WsMessage::Close(_)) | None => break,
                Some(_) => continue,
            }
        }
    }

    #[test]
    fn test_reason_is_truncated() {
        let long = "e".repeat(500);
        assert_eq!(truncate_reason(&long).chars().count(), MAX_REASON_CHARS);
        assert_eq!(truncate_reason("refused"), "refused");
    }
}

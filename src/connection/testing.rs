//! In-memory transport for connection tests

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Sink;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use url::Url;

use crate::connection::transport::{FrameSink, FrameStream, Transport};
use crate::error::{Error, Result};

/// Sink half backed by an unbounded channel; closing drops the sender
struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<WsMessage>>,
}

impl Sink<WsMessage> for ChannelSink {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        match self.tx {
            Some(_) => Poll::Ready(Ok(())),
            None => Poll::Ready(Err(WsError::AlreadyClosed)),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: WsMessage) -> std::result::Result<(), WsError> {
        let tx = self.tx.as_ref().ok_or(WsError::AlreadyClosed)?;
        tx.send(item).map_err(|_| WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}

/// Server side of an in-memory session
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<WsMessage>,
    inbound: mpsc::UnboundedSender<std::result::Result<WsMessage, WsError>>,
}

impl MemoryPeer {
    /// Next frame the client wrote; `None` once the client closed its sink
    pub async fn next_outbound(&mut self) -> Option<WsMessage> {
        self.outbound.recv().await
    }

    /// Frames written so far without waiting
    pub fn drain_outbound(&mut self) -> Vec<WsMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.inbound.send(Ok(WsMessage::Text(text.to_string())));
    }

    pub fn send_frame(&self, frame: WsMessage) {
        let _ = self.inbound.send(Ok(frame));
    }

    pub fn send_error(&self, error: WsError) {
        let _ = self.inbound.send(Err(error));
    }
}

/// A connected sink/stream pair plus the peer that drives it
pub fn memory_pair() -> (FrameSink, FrameStream, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let sink: FrameSink = Box::pin(ChannelSink { tx: Some(out_tx) });
    let stream: FrameStream = Box::pin(futures_util::stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    (
        sink,
        stream,
        MemoryPeer {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}

/// Transport that plays back a script of handshake results
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(FrameSink, FrameStream)>>>,
    urls: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failed handshake
    pub fn fail(&self, message: &str) {
        self.script
            .lock()
            .push_back(Err(Error::handshake("ws://memory", message)));
    }

    /// Queue a successful handshake; returns the peer for that session
    pub fn accept(&self) -> MemoryPeer {
        let (sink, stream, peer) = memory_pair();
        self.script.lock().push_back(Ok((sink, stream)));
        peer
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::handshake("ws://memory", "connection refused")))
    }
}

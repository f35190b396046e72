//! Transport seam between the connection manager and the network
//!
//! `Transport::connect` performs the handshake and hands back the two halves
//! of a message session. `WsTransport` is the production implementation over
//! tokio-tungstenite; tests substitute an in-memory one.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::config::{ConnectionSettings, TOKEN_PLACEHOLDER};
use crate::error::{Error, Result};

/// Write half of a session
pub type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;

/// Read half of a session
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<WsMessage, WsError>> + Send>>;

/// Headers the WebSocket handshake owns; configured values for these are ignored
const HANDSHAKE_HEADERS: [&str; 6] = [
    "host",
    "connection",
    "upgrade",
    "sec-websocket-version",
    "sec-websocket-key",
    "sec-websocket-extensions",
];

/// Establishes message sessions with the node endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake against `url`
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream)>;
}

// ─────────────────────────────────────────────────────────────────
// Endpoint URL
// ─────────────────────────────────────────────────────────────────

/// Build the endpoint URL by placing the percent-encoded token into the template
pub fn endpoint_url(template: &str, token: &str) -> Result<Url> {
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::InvalidToken("token is empty".to_string()));
    }

    let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    let raw = template.replace(TOKEN_PLACEHOLDER, &encoded);

    Url::parse(&raw).map_err(|e| Error::Config(format!("Invalid endpoint URL: {}", e)))
}

/// URL without query or credentials, safe to log
pub fn redacted(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
        None => format!("{}://{}{}", url.scheme(), host, url.path()),
    }
}

// ─────────────────────────────────────────────────────────────────
// WebSocket Transport
// ─────────────────────────────────────────────────────────────────

/// tokio-tungstenite transport with static negotiation headers
#[derive(Debug, Clone)]
pub struct WsTransport {
    headers: BTreeMap<String, String>,
    connect_timeout: Option<Duration>,
}

impl WsTransport {
    /// Create a transport from connection settings
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            headers: settings.headers.clone(),
            connect_timeout: settings.connect_timeout(),
        }
    }

    fn build_request(
        &self,
        url: &Url,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::handshake(redacted(url), e.to_string()))?;

        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            if HANDSHAKE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                debug!(header = %name, "Skipping handshake-owned header");
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Ignoring invalid header"),
            }
        }

        Ok(request)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url) -> Result<(FrameSink, FrameStream)> {
        let request = self.build_request(url)?;
        let target = redacted(url);

        let connected = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect_async(request))
                .await
                .map_err(|_| Error::ConnectionTimeout {
                    url: target.clone(),
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => connect_async(request).await,
        };

        let (ws_stream, response) =
            connected.map_err(|e| Error::handshake(target.clone(), e.to_string()))?;
        debug!(url = %target, status = %response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();
        Ok((Box::pin(write), Box::pin(read)))
    }
}

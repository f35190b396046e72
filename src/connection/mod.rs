//! Node endpoint connection
//!
//! - `transport`: handshake seam and the WebSocket implementation
//! - `session`: one live connection and the command sender
//! - `heartbeat`: periodic keepalive while a session is live
//! - `dispatcher`: routes inbound messages by type
//! - `policy`: reconnect backoff and attempt budget
//! - `manager`: the lifecycle state machine tying it together

pub mod dispatcher;
pub mod heartbeat;
pub mod manager;
pub mod policy;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{ConnectionManager, RunOutcome};

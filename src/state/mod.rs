//! Persisted connection state
//!
//! A flat key/value record that survives restarts. The connection manager is
//! the only writer; every mutation reaches disk before the call returns.

mod store;

pub use store::*;

/// Access token for the node endpoint
pub const KEY_TOKEN: &str = "wsToken";

/// Human-readable status mirroring the connection state
pub const KEY_STATUS: &str = "connectionStatus";

/// RFC 3339 UTC timestamp of when the last live session ended
pub const KEY_LAST_DISCONNECTED: &str = "lastDisconnected";

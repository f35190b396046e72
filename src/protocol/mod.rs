//! Protocol module for node endpoint communication
//!
//! Defines the outbound command frame and the inbound message decoding.
//! The protocol is JSON text frames over WebSocket.

mod messages;

pub use messages::*;

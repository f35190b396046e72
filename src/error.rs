//! Error types for the edge node client
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for node client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO / state errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,
    StateCorrupt = 210,

    // Connection errors (3xx)
    HandshakeFailed = 300,
    ConnectionTimeout = 301,
    NotConnected = 302,
    ConnectionLost = 303,
    TransportFailed = 304,
    RetryExhausted = 305,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    InvalidToken = 403,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the node client
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO / Persisted State Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encode/decode error outside the inbound message path
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted state file exists but cannot be used
    #[error("State file {path} is corrupt: {message}")]
    StateCorrupt { path: PathBuf, message: String },

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Handshake with the node endpoint did not complete
    #[error("Handshake with {url} failed: {message}")]
    Handshake { url: String, message: String },

    /// Handshake did not complete within the configured timeout
    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// No open session to send on
    #[error("WebSocket not connected")]
    NotConnected,

    /// Established session ended (remote close or read error)
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// Send or receive failure on an established session
    #[error("Transport error: {0}")]
    Transport(String),

    /// Reconnect bound reached; no further automatic recovery
    #[error("Giving up after {attempts} failed connection attempts")]
    RetryExhausted { attempts: u32 },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Inbound frame could not be decoded into a typed message
    #[error("Malformed inbound message: {message}")]
    Decode { message: String },

    /// Token is empty or cannot be placed into the endpoint URL
    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::StateCorrupt,
            Error::StateCorrupt { .. } => ErrorCode::StateCorrupt,

            Error::Handshake { .. } => ErrorCode::HandshakeFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::NotConnected => ErrorCode::NotConnected,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::Transport(_) => ErrorCode::TransportFailed,
            Error::RetryExhausted { .. } => ErrorCode::RetryExhausted,

            Error::Decode { .. } => ErrorCode::ProtocolMalformed,
            Error::InvalidToken(_) => ErrorCode::InvalidToken,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'edge-node config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'edge-node config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::StateCorrupt { .. } => Some(
                "The state file will be rewritten on the next status change. Delete it to start fresh."
            ),
            Error::Handshake { .. } => Some(
                "Check your network connection and verify the token is still valid."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The node endpoint may be down or unreachable. Check your firewall settings."
            ),
            Error::RetryExhausted { .. } => Some(
                "The endpoint kept refusing connections. Run 'edge-node token set' if the token expired, then restart."
            ),
            Error::InvalidToken(_) => Some(
                "Run 'edge-node token set' to store a new access token."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a handshake failure
    pub fn handshake(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Handshake {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a connection lost error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Error::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Error::Decode {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

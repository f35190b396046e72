//! Configuration system for the edge node client
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (EDGE_NODE_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Placeholder in the endpoint URL template replaced by the access token
pub const TOKEN_PLACEHOLDER: &str = "{token}";

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Endpoint and session settings
    pub connection: ConnectionSettings,

    /// Reconnect backoff and bound
    pub reconnect: ReconnectSettings,

    /// Persisted state location
    pub storage: StorageSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Endpoint and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// WebSocket URL template; `{token}` is replaced with the access token
    pub url_template: String,

    /// Handshake timeout in milliseconds (0 = leave it to the transport)
    pub connect_timeout_ms: u64,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Static headers sent with the WebSocket upgrade request
    pub headers: BTreeMap<String, String>,
}

/// Reconnect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Consecutive failed attempts after which the client gives up
    pub max_attempts: u32,

    /// Backoff unit in milliseconds; attempt n waits base * 2^n
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff wait in milliseconds
    pub max_delay_ms: u64,
}

/// Persisted state settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Path of the JSON state file
    pub state_file: String,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url_template: "wss://websocket.layeredge.io/ws/node?token={token}".to_string(),
            connect_timeout_ms: 30000,
            heartbeat_interval_ms: 25000,
            headers: default_headers(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_file: "~/.edge-node/storage.json".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

/// Browser-like negotiation headers expected by the endpoint
fn default_headers() -> BTreeMap<String, String> {
    [
        ("Pragma", "no-cache"),
        ("Cache-Control", "no-cache"),
        (
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36",
        ),
        ("Origin", "chrome-extension://fnjlbckpopjmpgkjgoiegmnnhahegbcb"),
        ("Accept-Encoding", "gzip, deflate, br, zstd"),
        ("Accept-Language", "en-US,en;q=0.9"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl ConnectionSettings {
    /// Heartbeat interval as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Handshake timeout, `None` when disabled
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: e.message().to_string(),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("edge-node.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("edge-node").join("config.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".edge-node").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Connection settings
        if let Ok(val) = std::env::var("EDGE_NODE_URL") {
            self.connection.url_template = val;
        }
        if let Ok(val) = std::env::var("EDGE_NODE_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.connection.connect_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("EDGE_NODE_HEARTBEAT_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.connection.heartbeat_interval_ms = n;
            }
        }

        // Reconnect settings
        if let Ok(val) = std::env::var("EDGE_NODE_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.reconnect.max_attempts = n;
            }
        }
        if let Ok(val) = std::env::var("EDGE_NODE_RECONNECT_BASE_MS") {
            if let Ok(n) = val.parse() {
                self.reconnect.base_delay_ms = n;
            }
        }
        if let Ok(val) = std::env::var("EDGE_NODE_RECONNECT_MAX_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.reconnect.max_delay_ms = n;
            }
        }

        // Storage settings
        if let Ok(val) = std::env::var("EDGE_NODE_STATE_FILE") {
            self.storage.state_file = val;
        }

        // Logging settings
        if let Ok(val) = std::env::var("EDGE_NODE_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("EDGE_NODE_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("EDGE_NODE_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.state_file = expand_path(&self.storage.state_file);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        let url = &self.connection.url_template;
        if url.is_empty() {
            return Err(Error::config_field_invalid(
                "connection.url_template",
                "Endpoint URL cannot be empty",
            ));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "connection.url_template",
                "Endpoint URL must start with ws:// or wss://",
            ));
        }
        if !url.contains(TOKEN_PLACEHOLDER) {
            return Err(Error::config_field_invalid(
                "connection.url_template",
                format!("Endpoint URL must contain the {} placeholder", TOKEN_PLACEHOLDER),
            ));
        }

        if self.connection.heartbeat_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "connection.heartbeat_interval_ms",
                "Heartbeat interval must be greater than zero",
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(Error::config_field_invalid(
                "reconnect.max_attempts",
                "max_attempts must be at least 1",
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(Error::config_field_invalid(
                "reconnect.max_delay_ms",
                "max_delay_ms must not be smaller than base_delay_ms",
            ));
        }

        if self.storage.state_file.is_empty() {
            return Err(Error::config_field_invalid(
                "storage.state_file",
                "State file path cannot be empty",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Get the state file as a PathBuf
    pub fn state_file(&self) -> PathBuf {
        PathBuf::from(&self.storage.state_file)
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file, returning where it was written
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".edge-node")
                .join("config.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Edge Node Client Configuration

[connection]
# WebSocket endpoint; {token} is replaced with the access token
url_template = "wss://websocket.layeredge.io/ws/node?token={token}"

# Handshake timeout in milliseconds (0 = leave it to the transport)
connect_timeout_ms = 30000

# Heartbeat interval in milliseconds
heartbeat_interval_ms = 25000

# Static headers sent with the upgrade request
[connection.headers]
"Pragma" = "no-cache"
"Cache-Control" = "no-cache"
"User-Agent" = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36"
"Origin" = "chrome-extension://fnjlbckpopjmpgkjgoiegmnnhahegbcb"
"Accept-Encoding" = "gzip, deflate, br, zstd"
"Accept-Language" = "en-US,en;q=0.9"

[reconnect]
# Consecutive failed attempts before giving up
max_attempts = 5

# Backoff unit in milliseconds (attempt n waits base * 2^n)
base_delay_ms = 1000

# Longest single backoff wait in milliseconds
max_delay_ms = 30000

[storage]
# Persisted token and connection status
state_file = "~/.edge-node/storage.json"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.edge-node/logs/edge-node.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

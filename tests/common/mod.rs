//! Shared fixtures for the CLI integration tests
#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use tempfile::TempDir;

/// Environment variables that would leak the developer's setup into a test
const ENV_OVERRIDES: [&str; 13] = [
    "EDGE_NODE_CONFIG",
    "EDGE_NODE_TOKEN",
    "EDGE_NODE_URL",
    "EDGE_NODE_CONNECT_TIMEOUT_MS",
    "EDGE_NODE_HEARTBEAT_INTERVAL_MS",
    "EDGE_NODE_MAX_RECONNECT_ATTEMPTS",
    "EDGE_NODE_RECONNECT_BASE_MS",
    "EDGE_NODE_RECONNECT_MAX_DELAY_MS",
    "EDGE_NODE_STATE_FILE",
    "EDGE_NODE_LOG_LEVEL",
    "EDGE_NODE_LOG_FILE",
    "EDGE_NODE_LOG_JSON",
    "RUST_LOG",
];

/// The edge-node binary with a clean environment
pub fn node_cmd() -> Command {
    let mut cmd = Command::cargo_bin("edge-node").unwrap();
    for var in ENV_OVERRIDES {
        cmd.env_remove(var);
    }
    cmd
}

/// A temp directory holding a config file and the state file it points at
pub struct NodeFixture {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
}

impl NodeFixture {
    /// Fixture for an endpoint URL template and an attempt budget.
    /// Delays are in milliseconds so failing runs finish quickly.
    pub fn new(url_template: &str, max_attempts: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        let state_path = dir.path().join("state").join("storage.json");

        let fixture = Self {
            dir,
            config_path,
            state_path,
        };
        fixture.write_config(&format!(
            r#"
[connection]
url_template = '{url}'
connect_timeout_ms = 2000
heartbeat_interval_ms = 50

[reconnect]
max_attempts = {max_attempts}
base_delay_ms = 10
max_delay_ms = 40

[storage]
state_file = '{state}'

[logging]
level = "debug"
"#,
            url = url_template,
            max_attempts = max_attempts,
            state = fixture.state_path.display(),
        ));
        fixture
    }

    /// Fixture whose endpoint is never contacted
    pub fn offline() -> Self {
        Self::new("ws://127.0.0.1:9/ws/node?token={token}", 1)
    }

    pub fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    pub fn config(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    /// Parsed state file
    pub fn read_state(&self) -> serde_json::Value {
        let raw = fs::read_to_string(&self.state_path).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    pub fn write_state(&self, content: &str) {
        fs::create_dir_all(self.state_path.parent().unwrap()).unwrap();
        fs::write(&self.state_path, content).unwrap();
    }
}

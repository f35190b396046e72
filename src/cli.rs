//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// Edge node keepalive client
///
/// Keeps an authenticated WebSocket connection to the node endpoint open,
/// sends heartbeats, and reconnects with bounded backoff.
#[derive(Parser, Debug)]
#[command(name = "edge-node")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect and stay connected until Ctrl+C or the reconnect limit
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "EDGE_NODE_CONFIG")]
        config: Option<String>,

        /// Access token; saved for later runs
        #[arg(long, env = "EDGE_NODE_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Show the persisted connection status
    Status {
        /// Path to configuration file
        #[arg(short, long, env = "EDGE_NODE_CONFIG")]
        config: Option<String>,
    },

    /// Manage the stored access token
    Token {
        #[command(subcommand)]
        subcommand: TokenSubcommand,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TokenSubcommand {
    /// Print the stored token, masked unless --reveal is given
    Show {
        #[arg(short, long, env = "EDGE_NODE_CONFIG")]
        config: Option<String>,

        /// Print the full token
        #[arg(long)]
        reveal: bool,
    },

    /// Store a token
    Set {
        token: String,

        #[arg(short, long, env = "EDGE_NODE_CONFIG")]
        config: Option<String>,
    },

    /// Remove the stored token
    Clear {
        #[arg(short, long, env = "EDGE_NODE_CONFIG")]
        config: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Where to create the file (default ~/.edge-node/config.toml)
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Check a configuration file
    Validate {
        #[arg(short, long)]
        config: Option<String>,
    },
}

impl Commands {
    /// Config file named by the command, if it takes one
    pub fn config_path(&self) -> Option<&str> {
        match self {
            Commands::Run { config, .. } | Commands::Status { config } => config.as_deref(),
            Commands::Token { subcommand } => match subcommand {
                TokenSubcommand::Show { config, .. }
                | TokenSubcommand::Set { config, .. }
                | TokenSubcommand::Clear { config } => config.as_deref(),
            },
            Commands::Config { .. } | Commands::Version => None,
        }
    }
}

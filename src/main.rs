//! edge-node - keepalive client for an edge network node endpoint
//!
//! Resolves an access token, opens the WebSocket session, keeps it alive
//! with heartbeats and reconnects with bounded backoff. Connection status is
//! persisted so `edge-node status` can report it from another shell.

mod cli;
mod config;
mod connection;
mod error;
mod logging;
mod protocol;
mod state;
mod token;
mod version;

use clap::Parser;
use tracing::{info, Level};

use crate::cli::{Cli, Commands, ConfigSubcommand, TokenSubcommand};
use crate::config::NodeConfig;
use crate::connection::{ConnectionManager, RunOutcome};
use crate::error::{Error, Result};
use crate::state::{JsonFileStore, StateStore, KEY_LAST_DISCONNECTED, KEY_STATUS, KEY_TOKEN};
use crate::token::StdinPrompt;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = execute(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn execute(cli: Cli) -> Result<()> {
    let simple_level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose > 0 {
        Level::DEBUG
    } else {
        Level::WARN
    };

    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(simple_level)?;
            handle_config_command(subcommand)
        }
        Commands::Status { config } => {
            logging::init_simple(simple_level)?;
            show_status(config.as_deref())
        }
        Commands::Token { subcommand } => {
            logging::init_simple(simple_level)?;
            handle_token_command(subcommand)
        }
        Commands::Run { config, token } => {
            run_node(config.as_deref(), token.as_deref(), cli.verbose, cli.quiet)
        }
    }
}

/// Resolve the token, then hold the connection until shutdown or give-up
fn run_node(
    config_path: Option<&str>,
    explicit_token: Option<&str>,
    verbose: u8,
    quiet: bool,
) -> Result<()> {
    let config = NodeConfig::load(config_path)?;

    // Guards flush the file writer on drop
    let _log_guards = logging::init_logging(&config.logging, verbose, quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting edge-node"
    );

    let mut store = JsonFileStore::open(config.state_file())?;
    info!(path = %store.path().display(), "State file opened");

    let (token, origin) = token::resolve_token(explicit_token, &mut store, &mut StdinPrompt)?;
    info!(origin = ?origin, token = %token::mask(&token), "Token ready");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("edge-node")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async {
        let mut manager = ConnectionManager::from_config(&config, Box::new(store));

        let shutdown = manager.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.shutdown();
            }
        });

        match manager.run(&token).await? {
            RunOutcome::Shutdown => {
                info!(status = %manager.store().get_or(KEY_STATUS, "unknown"), "edge-node stopped");
                Ok(())
            }
        }
    })
}

fn open_store(config_path: Option<&str>) -> Result<JsonFileStore> {
    let config = NodeConfig::load(config_path)?;
    JsonFileStore::open(config.state_file())
}

fn show_status(config_path: Option<&str>) -> Result<()> {
    let store = open_store(config_path)?;
    let token = store
        .get(KEY_TOKEN)
        .map(|t| token::mask(&t))
        .unwrap_or_else(|| "not set".to_string());

    println!("State file:        {}", store.path().display());
    println!("Status:            {}", store.get_or(KEY_STATUS, "never connected"));
    println!("Last disconnected: {}", store.get_or(KEY_LAST_DISCONNECTED, "never"));
    println!("Token:             {}", token);
    Ok(())
}

fn handle_token_command(subcommand: TokenSubcommand) -> Result<()> {
    match subcommand {
        TokenSubcommand::Show { config, reveal } => {
            let store = open_store(config.as_deref())?;
            match store.get(KEY_TOKEN) {
                Some(t) if reveal => println!("{}", t),
                Some(t) => println!("{}", token::mask(&t)),
                None => println!("No token stored."),
            }
        }
        TokenSubcommand::Set { token, config } => {
            let token = token.trim();
            if token.is_empty() {
                return Err(Error::InvalidToken("token is empty".to_string()));
            }
            let mut store = open_store(config.as_deref())?;
            store.set(KEY_TOKEN, token)?;
            println!("Token saved to {}", store.path().display());
        }
        TokenSubcommand::Clear { config } => {
            let mut store = open_store(config.as_deref())?;
            store.remove(KEY_TOKEN)?;
            println!("Token cleared.");
        }
    }

    Ok(())
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = NodeConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            NodeConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}

//! Access token resolution
//!
//! Order: explicit token (flag or environment), then the persisted
//! `wsToken`, then one interactive prompt. A token that did not come from the
//! store is written to it before the first connect, so later runs start
//! without asking.

use std::io::{self, BufRead, Write};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::state::{StateStore, KEY_TOKEN};

/// Where the token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    Explicit,
    Stored,
    Prompted,
}

/// Asks the operator for a token
pub trait TokenPrompt {
    fn ask(&mut self) -> Result<String>;
}

/// Reads one line from stdin after printing a prompt
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl TokenPrompt for StdinPrompt {
    fn ask(&mut self) -> Result<String> {
        let mut stdout = io::stdout();
        write!(stdout, "Enter wsToken: ")?;
        stdout.flush()?;

        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(Error::InvalidToken("no token entered (stdin closed)".to_string()));
        }
        Ok(line)
    }
}

/// Resolve the token to connect with, persisting it when it is new
pub fn resolve_token(
    explicit: Option<&str>,
    store: &mut dyn StateStore,
    prompt: &mut dyn TokenPrompt,
) -> Result<(String, TokenOrigin)> {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        persist_if_changed(store, token)?;
        return Ok((token.to_string(), TokenOrigin::Explicit));
    }

    if let Some(token) = store.get(KEY_TOKEN).filter(|t| !t.trim().is_empty()) {
        debug!("Using stored token");
        return Ok((token.trim().to_string(), TokenOrigin::Stored));
    }

    let entered = prompt.ask()?;
    let token = entered.trim();
    if token.is_empty() {
        return Err(Error::InvalidToken("token is empty".to_string()));
    }

    store.set(KEY_TOKEN, token)?;
    info!("Token saved");
    Ok((token.to_string(), TokenOrigin::Prompted))
}

fn persist_if_changed(store: &mut dyn StateStore, token: &str) -> Result<()> {
    if store.get(KEY_TOKEN).as_deref() != Some(token) {
        store.set(KEY_TOKEN, token)?;
        info!("Token saved");
    }
    Ok(())
}

/// Show only the ends of a token
pub fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

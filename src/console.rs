//! Operator console.
//!
//! Reads lines from stdin:
//!
//! ```text
//! /end, /shutdown   drain all sessions and stop the server
//! /kick <name>      disconnect one user
//! anything else     broadcast as a server message
//! ```

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::server::Server;

/// A parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Shutdown,
    Kick(String),
    Announce(String),
    Invalid(String),
    Empty,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return OperatorCommand::Empty;
        }
        if !trimmed.starts_with('/') {
            return OperatorCommand::Announce(trimmed.to_string());
        }

        let mut words = trimmed.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("/end" | "/shutdown"), None, _) => OperatorCommand::Shutdown,
            (Some("/kick"), Some(name), None) => OperatorCommand::Kick(name.to_string()),
            _ => OperatorCommand::Invalid(trimmed.to_string()),
        }
    }
}

/// Run operator commands from `input` until shutdown or end of input.
pub async fn run<R>(server: Arc<Server>, input: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Operator input closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read operator input");
                return;
            }
        };

        match OperatorCommand::parse(&line) {
            OperatorCommand::Shutdown => {
                info!("Shutdown requested by operator");
                server.shutdown().await;
                return;
            }
            OperatorCommand::Kick(name) => {
                // Failure is already logged by the server
                let _ = server.kick(&name);
            }
            OperatorCommand::Announce(message) => {
                server.announce(&message);
            }
            OperatorCommand::Invalid(line) => {
                warn!(command = %line, "Invalid server command");
            }
            OperatorCommand::Empty => {}
        }
    }
}

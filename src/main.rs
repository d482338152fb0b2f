//! chat-relay: a multi-user text chat server
//!
//! Clients connect over TCP and speak a length-prefixed text protocol.
//! The server:
//! - Assigns each connection a unique display name
//! - Relays broadcast and private messages
//! - Interprets slash-commands (/rename, /users, /whisper, /help, /leave)
//! - Takes operator commands on stdin (announce, /kick, /end)
//! - Drains every session before shutting down
//!
//! Configuration via CLI arguments or TOML file.

mod commands;
mod config;
mod console;
mod error;
mod handler;
mod protocol;
mod registry;
mod server;
mod session;

use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;

use config::Config;
use server::Server;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Timestamp format used in the log file
const LOG_FILE_TIME_FORMAT: &str = "%d/%m/%Y %I:%M:%S %p";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Couldn't start server! {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.listen_addr() {
        eprintln!("Couldn't start server! {e}");
        std::process::exit(1);
    }

    init_logging(&config)?;

    info!(
        host = %config.host,
        port = config.port,
        workers = ?config.workers,
        max_connections = config.max_connections,
        console = config.console,
        "Starting chat-relay server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let result = runtime.block_on(run(config));
    // A blocked stdin read would otherwise keep the runtime from exiting
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = &result {
        error!(error = %e, "Server stopped with an error");
    }
    result
}

/// Initialize logging to stderr, plus the log file when one is configured
fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_target(false)
                    .with_timer(ChronoLocal::new(LOG_FILE_TIME_FORMAT.to_string())),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let console = config.console;
    let server = Arc::new(Server::new(config));

    if console {
        let server = Arc::clone(&server);
        tokio::spawn(console::run(server, BufReader::new(tokio::io::stdin())));
    }

    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => {
                    server.shutdown().await;
                }
                Err(e) => warn!(error = %e, "Signal handling unavailable"),
            }
        });
    }

    server.run().await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C on Windows).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

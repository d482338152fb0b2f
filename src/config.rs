//! Configuration module for the chat server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the chat server
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-user text chat server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (required here or in the config file)
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also append logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Do not read operator commands from stdin
    #[arg(long)]
    pub no_console: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    pub port: Option<u16>,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Read operator commands from stdin
    #[serde(default = "default_console")]
    pub console: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            workers: None,
            max_connections: default_max_connections(),
            console: default_console(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file, appended to
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_console() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub console: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
            console: !cli.no_console && toml_config.server.console,
        })
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let listen = format!("{}:{}", self.host, self.port);
        listen
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(listen))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("No port given. Start the server with the port to listen on, e.g. `chat-relay 5000`")]
    MissingPort,
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("chat-relay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, None);
        assert_eq!(config.server.max_connections, 1024);
        assert!(config.server.console);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 5000
            workers = 4
            console = false

            [logging]
            level = "debug"
            file = "server.log"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, Some(5000));
        assert_eq!(config.server.workers, Some(4));
        assert!(!config.server.console);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("server.log")));
    }

    #[test]
    fn test_positional_port() {
        let config = Config::merge(cli(&["5000"]), TomlConfig::default()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert!(config.console);
    }

    #[test]
    fn test_missing_port_fails() {
        let err = Config::merge(cli(&[]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort));
    }

    #[test]
    fn test_non_numeric_port_rejected() {
        let args = ["chat-relay", "not-a-port"];
        assert!(CliArgs::try_parse_from(args).is_err());
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 5000
            max_connections = 10
            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["6000", "--max-connections", "20", "--log-level", "debug", "--no-console"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.log_level, "debug");
        assert!(!config.console);
    }

    #[test]
    fn test_explicit_cli_log_level_wins() {
        let toml_config: TomlConfig =
            toml::from_str("[server]\nport = 5000\n[logging]\nlevel = \"warn\"\n").unwrap();

        let config = Config::merge(cli(&["--log-level", "info"]), toml_config).unwrap();
        assert_eq!(config.log_level, "info");

        let config = Config::merge(cli(&["5000"]), TomlConfig::default()).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_port_used_without_cli_port() {
        let toml_config: TomlConfig = toml::from_str("[server]\nport = 7000\n").unwrap();
        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.port, 7000);
    }
}

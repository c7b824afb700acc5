//! Configuration module for the netplex endpoint.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Largest payload a single UDP datagram can carry over IPv4.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Command-line arguments for the endpoint
#[derive(Parser, Debug)]
#[command(name = "netplex")]
#[command(author = "netplex authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-protocol network endpoint (TCP, UDP, WebSocket)", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Address for the line-echo stream listener (e.g., 0.0.0.0:9000)
    #[arg(long)]
    pub stream_listen: Option<String>,

    /// Address for the datagram server (e.g., 0.0.0.0:9001)
    #[arg(long)]
    pub datagram_listen: Option<String>,

    /// Address for the WebSocket upgrade server (e.g., 0.0.0.0:8080)
    #[arg(long)]
    pub websocket_listen: Option<String>,

    /// Do not start the stream listener
    #[arg(long)]
    pub no_stream: bool,

    /// Do not start the datagram server
    #[arg(long)]
    pub no_datagram: bool,

    /// Do not start the WebSocket server
    #[arg(long)]
    pub no_websocket: bool,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent stream sessions
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What the process should do. Defaults to `serve`.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run all configured servers until interrupted
    Serve,
    /// Send lines to a stream listener and print the replies
    StreamClient {
        /// Listener address (e.g., 127.0.0.1:9000)
        addr: String,
        /// Send a single line instead of forwarding stdin
        message: Option<String>,
    },
    /// Send one datagram and print the acknowledgment
    DatagramClient {
        /// Server address (e.g., 127.0.0.1:9001)
        addr: String,
        /// Payload to send
        #[arg(default_value = "Hello, UDP Server!")]
        message: String,
    },
    /// Fetch a URL with an HTTP GET and print the body
    Fetch { url: String },
    /// Resolve a domain name to its IP addresses
    Resolve { domain: String },
    /// Send an ICMP echo to a host and print the round-trip time
    Probe { host: String },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_stream_listen")]
    pub stream_listen: String,
    #[serde(default = "default_datagram_listen")]
    pub datagram_listen: String,
    #[serde(default = "default_websocket_listen")]
    pub websocket_listen: String,
    /// Route that accepts the upgrade handshake
    #[serde(default = "default_websocket_path")]
    pub websocket_path: String,
    /// Number of runtime worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds to wait for services to stop before aborting them
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_listen: default_stream_listen(),
            datagram_listen: default_datagram_listen(),
            websocket_listen: default_websocket_listen(),
            websocket_path: default_websocket_path(),
            workers: None,
            max_connections: default_max_connections(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Per-session limits
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Longest accepted stream line in bytes (0 = unlimited)
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Largest datagram payload accepted without truncation
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

/// One-shot operations launched alongside the servers
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct StartupConfig {
    #[serde(default)]
    pub fetch: Vec<String>,
    #[serde(default)]
    pub resolve: Vec<String>,
    #[serde(default)]
    pub probe: Vec<String>,
}

impl StartupConfig {
    pub fn is_empty(&self) -> bool {
        self.fetch.is_empty() && self.resolve.is_empty() && self.probe.is_empty()
    }
}

/// Timeouts for one-shot operations, in seconds
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_fetch_timeout")]
    pub fetch: u64,
    #[serde(default = "default_resolve_timeout")]
    pub resolve: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_timeout(),
            resolve: default_resolve_timeout(),
            probe: default_probe_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_stream_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_datagram_listen() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_websocket_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_websocket_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_max_line_length() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_max_datagram_size() -> usize {
    1024
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_resolve_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Timeouts applied to the one-shot operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub fetch: Duration,
    pub resolve: Duration,
    pub probe: Duration,
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(t: &TimeoutConfig) -> Self {
        Timeouts {
            fetch: Duration::from_secs(t.fetch),
            resolve: Duration::from_secs(t.resolve),
            probe: Duration::from_secs(t.probe),
        }
    }
}

/// Final resolved configuration
///
/// A `None` listen address means the service is disabled.
#[derive(Debug, Clone)]
pub struct Config {
    pub stream_listen: Option<String>,
    pub datagram_listen: Option<String>,
    pub websocket_listen: Option<String>,
    pub websocket_path: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub shutdown_timeout: Duration,
    pub max_line_length: usize,
    pub max_datagram_size: usize,
    pub startup: StartupConfig,
    pub timeouts: Timeouts,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: &CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            session,
            startup,
            timeouts,
            logging,
        } = toml_config;

        let enabled = |disabled: bool, cli_value: &Option<String>, file_value: String| {
            if disabled {
                None
            } else {
                Some(cli_value.clone().unwrap_or(file_value))
            }
        };

        let config = Config {
            stream_listen: enabled(cli.no_stream, &cli.stream_listen, server.stream_listen),
            datagram_listen: enabled(cli.no_datagram, &cli.datagram_listen, server.datagram_listen),
            websocket_listen: enabled(
                cli.no_websocket,
                &cli.websocket_listen,
                server.websocket_listen,
            ),
            websocket_path: server.websocket_path,
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout),
            max_line_length: session.max_line_length,
            max_datagram_size: session.max_datagram_size,
            startup,
            timeouts: Timeouts::from(&timeouts),
            log_level: if cli.log_level != "info" {
                cli.log_level.clone()
            } else {
                logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.websocket_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "websocket_path must start with '/', got '{}'",
                self.websocket_path
            )));
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "max_datagram_size must be between 1 and {MAX_UDP_PAYLOAD}, got {}",
                self.max_datagram_size
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        let session = SessionConfig::default();
        Config {
            stream_listen: Some(server.stream_listen),
            datagram_listen: Some(server.datagram_listen),
            websocket_listen: Some(server.websocket_listen),
            websocket_path: server.websocket_path,
            workers: server.workers,
            max_connections: server.max_connections,
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout),
            max_line_length: session.max_line_length,
            max_datagram_size: session.max_datagram_size,
            startup: StartupConfig::default(),
            timeouts: Timeouts::from(&TimeoutConfig::default()),
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["netplex"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.stream_listen, "0.0.0.0:9000");
        assert_eq!(config.server.datagram_listen, "0.0.0.0:9001");
        assert_eq!(config.server.websocket_listen, "0.0.0.0:8080");
        assert_eq!(config.server.websocket_path, "/ws");
        assert_eq!(config.session.max_datagram_size, 1024);
        assert!(config.startup.is_empty());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            stream_listen = "127.0.0.1:7000"
            datagram_listen = "127.0.0.1:7001"
            workers = 4

            [session]
            max_line_length = 4096

            [startup]
            fetch = ["https://example.com"]
            resolve = ["google.com"]
            probe = ["8.8.8.8"]

            [timeouts]
            probe = 1

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.stream_listen, "127.0.0.1:7000");
        assert_eq!(config.server.datagram_listen, "127.0.0.1:7001");
        assert_eq!(config.server.websocket_listen, "0.0.0.0:8080");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.session.max_line_length, 4096);
        assert_eq!(config.startup.fetch, vec!["https://example.com"]);
        assert_eq!(config.startup.probe, vec!["8.8.8.8"]);
        assert_eq!(config.timeouts.probe, 1);
        assert_eq!(config.timeouts.fetch, 30);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            stream_listen = "127.0.0.1:7000"
            workers = 2

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let args = cli(&["--stream-listen", "127.0.0.1:7100", "-w", "8", "--log-level", "trace"]);
        let config = Config::merge(&args, toml_config).unwrap();

        assert_eq!(config.stream_listen.as_deref(), Some("127.0.0.1:7100"));
        assert_eq!(config.workers, Some(8));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_default_log_level_defers_to_toml() {
        let toml_config: TomlConfig = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let config = Config::merge(&cli(&[]), toml_config).unwrap();
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_disable_services() {
        let args = cli(&["--no-datagram", "--no-websocket"]);
        let config = Config::merge(&args, TomlConfig::default()).unwrap();
        assert_eq!(config.stream_listen.as_deref(), Some("0.0.0.0:9000"));
        assert!(config.datagram_listen.is_none());
        assert!(config.websocket_listen.is_none());
    }

    #[test]
    fn test_subcommand_parsing() {
        let args = cli(&["datagram-client", "127.0.0.1:9001"]);
        assert_eq!(
            args.command,
            Some(Command::DatagramClient {
                addr: "127.0.0.1:9001".to_string(),
                message: "Hello, UDP Server!".to_string(),
            })
        );

        let args = cli(&["resolve", "localhost"]);
        assert_eq!(
            args.command,
            Some(Command::Resolve {
                domain: "localhost".to_string()
            })
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        let toml_config: TomlConfig = toml::from_str("[server]\nwebsocket_path = \"ws\"").unwrap();
        assert!(matches!(
            Config::merge(&cli(&[]), toml_config),
            Err(ConfigError::Invalid(_))
        ));

        let toml_config: TomlConfig =
            toml::from_str("[session]\nmax_datagram_size = 70000").unwrap();
        assert!(matches!(
            Config::merge(&cli(&[]), toml_config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let args = cli(&["--config", "/nonexistent/netplex.toml"]);
        assert!(matches!(Config::load(&args), Err(ConfigError::FileRead(..))));
    }
}

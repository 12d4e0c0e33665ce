//! Configuration module for the threaded server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Lowest port accepted from the CLI or a config file.
pub const MIN_PORT: u16 = 1024;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "threaded-server")]
#[command(version = "0.1.0")]
#[command(about = "A thread-per-connection TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (1024-65535)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(MIN_PORT as i64..))]
    pub port: Option<u16>,

    /// Bind a dual-stack IPv6 socket instead of IPv4
    #[arg(long)]
    pub ipv6: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
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
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub enable_ipv6: bool,
    /// Rejected at startup; only TCP is served.
    #[serde(default)]
    pub enable_udp: bool,
    /// Advisory ceiling on live workers
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Listen backlog
    #[serde(default = "default_max_backlog")]
    pub max_backlog: u32,
    /// Readiness bound for full-buffer transfers, negative disables it
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i64,
    /// How long a handler waits for the next request, negative waits forever
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: i64,
    #[serde(default = "default_drain_poll_seconds")]
    pub drain_poll_seconds: u64,
    pub drain_timeout_seconds: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            enable_ipv6: false,
            enable_udp: false,
            max_clients: default_max_clients(),
            max_backlog: default_max_backlog(),
            timeout_seconds: default_timeout_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            drain_poll_seconds: default_drain_poll_seconds(),
            drain_timeout_seconds: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file, used when `to_stderr` is false
    pub file: Option<PathBuf>,
    #[serde(default = "default_to_stderr")]
    pub to_stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            to_stderr: default_to_stderr(),
        }
    }
}

fn default_port() -> u16 {
    8000
}

fn default_max_clients() -> usize {
    8
}

fn default_max_backlog() -> u32 {
    10
}

fn default_timeout_seconds() -> i64 {
    10
}

fn default_idle_timeout_seconds() -> i64 {
    -1
}

fn default_drain_poll_seconds() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_to_stderr() -> bool {
    true
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub enable_ipv6: bool,
    pub enable_udp: bool,
    pub max_clients: usize,
    pub max_backlog: u32,
    pub timeout_seconds: i64,
    pub idle_timeout_seconds: i64,
    pub drain_poll_seconds: u64,
    pub drain_timeout_seconds: Option<u64>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_to_stderr: bool,
    /// Config file the values were read from, if any
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default(), None)
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let source = cli.config.clone();
        let config = Self::merge(cli, toml_config, source);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig, source: Option<PathBuf>) -> Self {
        let server = toml_config.server;
        let logging = toml_config.logging;

        Config {
            port: cli.port.unwrap_or(server.port),
            enable_ipv6: cli.ipv6 || server.enable_ipv6,
            enable_udp: server.enable_udp,
            max_clients: server.max_clients,
            max_backlog: server.max_backlog,
            timeout_seconds: server.timeout_seconds,
            idle_timeout_seconds: server.idle_timeout_seconds,
            drain_poll_seconds: server.drain_poll_seconds,
            drain_timeout_seconds: server.drain_timeout_seconds,
            log_level: cli.log_level.unwrap_or(logging.level),
            log_file: logging.file,
            log_to_stderr: logging.to_stderr,
            source,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port < MIN_PORT {
            return Err(ConfigError::Invalid(format!(
                "port {} is below {}",
                self.port, MIN_PORT
            )));
        }
        if self.max_backlog == 0 || self.max_backlog > i32::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "max_backlog {} out of range",
                self.max_backlog
            )));
        }
        if self.drain_poll_seconds == 0 {
            return Err(ConfigError::Invalid(
                "drain_poll_seconds must be at least 1".to_string(),
            ));
        }
        if crate::logging::parse_level(&self.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Readiness bound for `send_all`/`recv_all`. `None` waits forever.
    pub fn io_timeout(&self) -> Option<Duration> {
        seconds_or_forever(self.timeout_seconds)
    }

    /// Bound on waiting for the next request on an open connection.
    pub fn idle_timeout(&self) -> Option<Duration> {
        seconds_or_forever(self.idle_timeout_seconds)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_secs(self.drain_poll_seconds)
    }

    pub fn drain_limit(&self) -> Option<Duration> {
        self.drain_timeout_seconds.map(Duration::from_secs)
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!(
            source = %self
                .source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string()),
            port = self.port,
            ip_version = if self.enable_ipv6 { "IPv6" } else { "IPv4" },
            transport = if self.enable_udp { "UDP" } else { "TCP" },
            max_clients = self.max_clients,
            max_backlog = self.max_backlog,
            timeout_seconds = self.timeout_seconds,
            idle_timeout_seconds = self.idle_timeout_seconds,
            log_level = %self.log_level,
            "Server configuration"
        );
    }
}

/// Negative values disable the bound.
fn seconds_or_forever(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

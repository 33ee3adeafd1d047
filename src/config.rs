//! Configuration module for the chat relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::framing::Framing;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the chat server
#[derive(Parser, Debug, Default)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "A TCP chat relay server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:5050)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// What to do with connections beyond the limit
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Wire framing: newline-delimited JSON or one frame per socket read
    #[arg(short = 'f', long, value_enum)]
    pub framing: Option<Framing>,

    /// Close a connection after this many idle seconds (0 = never)
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Session lifetime in seconds (0 = never expire)
    #[arg(long)]
    pub session_ttl: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Overflow behaviour once `max_connections` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Accept and immediately close surplus connections
    #[default]
    Reject,
    /// Stop accepting until a slot frees up
    Queue,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Idle read timeout in seconds
    #[serde(default)]
    pub read_timeout: u64,
    /// Per-frame write timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    /// Frames buffered per connection before deliveries are dropped
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: 0,
            overflow: OverflowPolicy::default(),
            read_timeout: 0,
            write_timeout: default_write_timeout(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Wire framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default)]
    pub mode: Framing,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            mode: Framing::default(),
            max_frame_len: default_max_frame_len(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Session store configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime in seconds
    #[serde(default)]
    pub ttl: u64,
    /// Interval for sweeping expired sessions in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: 0,
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

/// Password hashing cost for the in-memory user store
#[derive(Debug, Deserialize)]
pub struct UsersConfig {
    #[serde(default = "default_hash_memory_kib")]
    pub hash_memory_kib: u32,
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            hash_memory_kib: default_hash_memory_kib(),
            hash_iterations: default_hash_iterations(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_listen() -> String {
    "127.0.0.1:5050".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_write_timeout() -> u64 {
    10
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_frame_len() -> usize {
    64 * 1024
}

fn default_chunk_size() -> usize {
    1024
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_hash_memory_kib() -> u32 {
    19 * 1024
}

fn default_hash_iterations() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    pub max_connections: usize,
    pub overflow: OverflowPolicy,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub outbound_queue: usize,
    pub framing: Framing,
    pub max_frame_len: usize,
    pub chunk_size: usize,
    pub session_ttl: u64,
    pub cleanup_interval: u64,
    pub hash_memory_kib: u32,
    pub hash_iterations: u32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::resolve(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            overflow: cli.overflow.unwrap_or(toml_config.server.overflow),
            read_timeout: cli.read_timeout.unwrap_or(toml_config.server.read_timeout),
            write_timeout: toml_config.server.write_timeout,
            outbound_queue: toml_config.server.outbound_queue.max(1),
            framing: cli.framing.unwrap_or(toml_config.framing.mode),
            max_frame_len: toml_config.framing.max_frame_len,
            chunk_size: toml_config.framing.chunk_size.max(1),
            session_ttl: cli.session_ttl.unwrap_or(toml_config.sessions.ttl),
            cleanup_interval: toml_config.sessions.cleanup_interval.max(1),
            hash_memory_kib: toml_config.users.hash_memory_kib,
            hash_iterations: toml_config.users.hash_iterations,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::default(), TomlConfig::default())
    }
}

/// Per-connection knobs derived from `Config`, copied into every handler task.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub outbound_queue: usize,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            read_timeout: seconds(config.read_timeout),
            write_timeout: seconds(config.write_timeout),
            outbound_queue: config.outbound_queue,
        }
    }
}

/// Zero means "no timeout".
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

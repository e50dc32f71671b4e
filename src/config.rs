//! Configuration module for pipebench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::monitor::MonitorSettings;
use crate::producer::ProducerSettings;

/// Command-line arguments for the load generator
#[derive(Parser, Debug, Default)]
#[command(name = "pipebench")]
#[command(author = "pipebench authors")]
#[command(version = "0.1.0")]
#[command(about = "Pipelined throughput benchmark for framed Thrift servers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Target host
    #[arg(long)]
    pub host: Option<String>,

    /// Target port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of parallel connections, each with its own producer and consumer
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Requests sent back-to-back per burst
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Pause between bursts in milliseconds
    #[arg(short, long)]
    pub sleep_ms: Option<u64>,

    /// RPC method name
    #[arg(long)]
    pub method: Option<String>,

    /// Value of the request's string field
    #[arg(long)]
    pub payload: Option<String>,

    /// Hold bursts after this many consecutive bursts without responses
    #[arg(long)]
    pub stall_bursts: Option<u32>,

    /// Throughput sampling period in milliseconds
    #[arg(long)]
    pub sample_period_ms: Option<u64>,

    /// Reporting period in milliseconds once the run has failed
    #[arg(long)]
    pub idle_period_ms: Option<u64>,

    /// Run a reply server on this address instead of generating load
    #[arg(long, value_name = "ADDR")]
    pub serve: Option<String>,

    /// Result string returned by the reply server
    #[arg(long)]
    pub reply: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target server configuration
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connections")]
    pub connections: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connections: default_connections(),
        }
    }
}

/// Request generation configuration
#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_payload")]
    pub payload: String,
    pub stall_bursts: Option<u32>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sleep_ms: default_sleep_ms(),
            method: default_method(),
            payload: default_payload(),
            stall_bursts: None,
        }
    }
}

/// Throughput reporting configuration
#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,
    #[serde(default = "default_idle_period_ms")]
    pub idle_period_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: default_sample_period_ms(),
            idle_period_ms: default_idle_period_ms(),
        }
    }
}

/// Reply server configuration
#[derive(Debug, Deserialize)]
pub struct PeerConfig {
    pub listen: Option<String>,
    #[serde(default = "default_reply")]
    pub reply: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            reply: default_reply(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    55678
}

fn default_connections() -> usize {
    1
}

fn default_batch_size() -> usize {
    4000
}

fn default_sleep_ms() -> u64 {
    100
}

fn default_method() -> String {
    "test".to_string()
}

fn default_payload() -> String {
    "hello".to_string()
}

fn default_sample_period_ms() -> u64 {
    1000
}

fn default_idle_period_ms() -> u64 {
    10_000
}

fn default_reply() -> String {
    "world".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub connections: usize,
    pub batch_size: usize,
    pub sleep_ms: u64,
    pub method: String,
    pub payload: String,
    pub stall_bursts: Option<u32>,
    pub sample_period_ms: u64,
    pub idle_period_ms: u64,
    pub serve: Option<String>,
    pub reply: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        // Defaults come from the file layer so there is one source of truth.
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML config.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.target.host),
            port: cli.port.unwrap_or(toml_config.target.port),
            connections: cli.connections.unwrap_or(toml_config.target.connections),
            batch_size: cli.batch_size.unwrap_or(toml_config.load.batch_size),
            sleep_ms: cli.sleep_ms.unwrap_or(toml_config.load.sleep_ms),
            method: cli.method.unwrap_or(toml_config.load.method),
            payload: cli.payload.unwrap_or(toml_config.load.payload),
            stall_bursts: cli.stall_bursts.or(toml_config.load.stall_bursts),
            sample_period_ms: cli
                .sample_period_ms
                .unwrap_or(toml_config.monitor.sample_period_ms),
            idle_period_ms: cli
                .idle_period_ms
                .unwrap_or(toml_config.monitor.idle_period_ms),
            serve: cli.serve.or(toml_config.peer.listen),
            reply: cli.reply.unwrap_or(toml_config.peer.reply),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject settings the harness cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.connections == 0 {
            return Err(ConfigError::Invalid("connections must be at least 1".into()));
        }
        if self.sample_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "sample_period_ms must be at least 1".into(),
            ));
        }
        if self.idle_period_ms == 0 {
            return Err(ConfigError::Invalid("idle_period_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            batch_size: self.batch_size,
            sleep: Duration::from_millis(self.sleep_ms),
            stall_bursts: self.stall_bursts,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            sample_period: Duration::from_millis(self.sample_period_ms),
            idle_period: Duration::from_millis(self.idle_period_ms),
        }
    }
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

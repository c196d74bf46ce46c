//! Configuration for channels and the echo server binary.
//!
//! `ChannelConfig` is what the library consumes. The binary builds it from
//! command-line arguments and an optional TOML file; CLI arguments take
//! precedence over config file values.

use crate::error::ChannelError;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Payload compressor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    /// Payload bytes are sent as-is.
    #[default]
    None,
    /// zstd, one independent compressed block per frame.
    Zstd,
}

/// Engine settings shared by server and client channels.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Number of I/O workers (0 = one per available CPU).
    pub workers: usize,
    /// Bytes read from a socket per bounded read.
    pub read_buffer_size: usize,
    /// SO_RCVBUF / SO_SNDBUF hint for every socket.
    pub socket_buffer_size: Option<usize>,
    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: usize,
    pub compressor: CompressorKind,
    pub compression_level: i32,
    pub connect_timeout_ms: u64,
    /// How long a closing connection may spend flushing queued frames.
    pub close_linger_ms: u64,
    /// Capacity of the per-poll event batch.
    pub events_capacity: usize,
    pub tcp_nodelay: bool,
    pub listen_backlog: i32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            read_buffer_size: 16 * 1024,
            socket_buffer_size: None,
            max_frame_size: 16 * 1024 * 1024,
            compressor: CompressorKind::None,
            compression_level: 3,
            connect_timeout_ms: 5_000,
            close_linger_ms: 2_000,
            events_capacity: 1024,
            tcp_nodelay: true,
            listen_backlog: 1024,
        }
    }
}

impl ChannelConfig {
    /// Check the settings for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.read_buffer_size == 0 {
            return Err(ChannelError::Config("read_buffer_size must be > 0".into()));
        }
        if self.max_frame_size == 0 {
            return Err(ChannelError::Config("max_frame_size must be > 0".into()));
        }
        if self.max_frame_size as u64 > u32::MAX as u64 {
            return Err(ChannelError::Config(format!(
                "max_frame_size {} does not fit a 4-byte length prefix",
                self.max_frame_size
            )));
        }
        if self.events_capacity == 0 {
            return Err(ChannelError::Config("events_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "wirechan-echo")]
#[command(version = "0.1.0")]
#[command(about = "Length-framed TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:10000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of I/O worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum frame payload size in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Payload compressor
    #[arg(long, value_enum)]
    pub compressor: Option<CompressorKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:10000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration for the binary.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub channel: ChannelConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut channel = toml_config.channel;
        if let Some(workers) = cli.workers.or(toml_config.server.workers) {
            channel.workers = workers;
        }
        if let Some(max) = cli.max_frame_size {
            channel.max_frame_size = max;
        }
        if let Some(kind) = cli.compressor {
            channel.compressor = kind;
        }
        channel.validate()?;

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            channel,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ChannelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:10000");
        assert_eq!(config.channel.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.channel.compressor, CompressorKind::None);
        assert!(config.channel.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4

            [channel]
            max_frame_size = 1024
            compressor = "zstd"
            close_linger_ms = 100

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.channel.max_frame_size, 1024);
        assert_eq!(config.channel.compressor, CompressorKind::Zstd);
        assert_eq!(config.channel.close_linger(), Duration::from_millis(100));
        // untouched fields keep their defaults
        assert_eq!(config.channel.read_buffer_size, 16 * 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::parse_from([
            "wirechan-echo",
            "--listen",
            "127.0.0.1:7000",
            "--workers",
            "2",
            "--compressor",
            "zstd",
        ]);
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.channel.workers, 2);
        assert_eq!(config.channel.worker_count(), 2);
        assert_eq!(config.channel.compressor, CompressorKind::Zstd);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ChannelConfig {
            max_frame_size: 0,
            ..ChannelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChannelError::Config(_))));

        let config = ChannelConfig {
            read_buffer_size: 0,
            ..ChannelConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

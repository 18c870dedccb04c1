//! Configuration for the ferryd server.
//!
//! Three layers: required command-line arguments (root, port, send rate),
//! an optional TOML file for runtime tunables, and a pipe-delimited reload
//! file picked up on SIGUSR1. CLI arguments take precedence over the TOML
//! file.

use clap::Parser;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reload file read from the working directory on SIGUSR1.
pub const RELOAD_FILE: &str = "ferryd.conf";

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "ferryd")]
#[command(version = "0.1.0")]
#[command(about = "A rate-limited HTTP/1.0 file transfer daemon", long_about = None)]
pub struct CliArgs {
    /// Directory served as the transfer root
    pub root_path: PathBuf,

    /// TCP port to listen on
    pub port: u16,

    /// Outbound cap per connection, in bytes per second
    pub send_rate: u64,

    /// Path to a TOML configuration file with runtime tunables
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Runtime tunables
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Number of disk worker threads
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    /// log2 of the per-connection ring buffer size in bytes
    #[serde(default = "default_buffer_order")]
    pub buffer_order: u32,
    /// Per-request disk transfer clamp in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Bound of the disk request queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Maximum simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            io_threads: default_io_threads(),
            buffer_order: default_buffer_order(),
            chunk_size: default_chunk_size(),
            queue_depth: default_queue_depth(),
            max_connections: default_max_connections(),
        }
    }
}

/// Connection limits
#[derive(Debug, Deserialize, Default)]
pub struct LimitsConfig {
    /// Idle cutoff during body transfer, in seconds (0 = disabled)
    #[serde(default)]
    pub body_timeout_secs: u64,
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

fn default_io_threads() -> usize {
    10
}

fn default_buffer_order() -> u32 {
    16 // 64 KiB rings
}

fn default_chunk_size() -> usize {
    8192
}

fn default_queue_depth() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub root_path: PathBuf,
    pub port: u16,
    pub send_rate: u64,
    pub io_threads: usize,
    pub buffer_order: u32,
    pub chunk_size: usize,
    pub queue_depth: usize,
    pub max_connections: usize,
    /// `None` leaves body-phase transfers without an idle cutoff.
    pub body_timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and the optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse().map_err(ConfigError::Cli)?;
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        if cli.root_path.as_os_str().len() >= libc::PATH_MAX as usize {
            return Err(ConfigError::RootTooLong);
        }
        if cli.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if cli.send_rate == 0 {
            return Err(ConfigError::InvalidRate);
        }

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            root_path: cli.root_path,
            port: cli.port,
            send_rate: cli.send_rate,
            io_threads: toml_config.runtime.io_threads,
            buffer_order: toml_config.runtime.buffer_order,
            chunk_size: toml_config.runtime.chunk_size,
            queue_depth: toml_config.runtime.queue_depth,
            max_connections: toml_config.runtime.max_connections,
            body_timeout: match toml_config.limits.body_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Cli(clap::Error),
    FileRead(PathBuf, io::Error),
    TomlParse(PathBuf, toml::de::Error),
    RootTooLong,
    InvalidPort,
    InvalidRate,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Cli(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::RootTooLong => write!(f, "Root path exceeds the system path limit"),
            ConfigError::InvalidPort => write!(f, "Port must be nonzero"),
            ConfigError::InvalidRate => write!(f, "Send rate must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Settings parsed from the SIGUSR1 reload file:
/// `root_path|port|send_rate|`, pipe-delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadFile {
    pub root_path: PathBuf,
    pub port: u16,
    pub send_rate: u64,
}

impl ReloadFile {
    /// Read and parse the reload file. `None` on any read or parse failure;
    /// the caller keeps its current settings.
    pub fn load(path: &Path) -> Option<ReloadFile> {
        let contents = std::fs::read_to_string(path).ok()?;
        Self::parse(&contents)
    }

    /// Parse the pipe-delimited fields. All three must be present and valid.
    pub fn parse(contents: &str) -> Option<ReloadFile> {
        let mut fields = contents.split('|');

        let root = fields.next()?.trim();
        if root.is_empty() {
            return None;
        }
        let port: u16 = fields.next()?.trim().parse().ok()?;
        if port == 0 {
            return None;
        }
        let send_rate: u64 = fields.next()?.trim().parse().ok()?;
        if send_rate == 0 {
            return None;
        }

        Some(ReloadFile {
            root_path: PathBuf::from(root),
            port,
            send_rate,
        })
    }

    /// The new root must be a directory the server can both read and write.
    pub fn root_accessible(&self) -> bool {
        let Ok(meta) = std::fs::metadata(&self.root_path) else {
            return false;
        };
        if !meta.is_dir() {
            return false;
        }
        let Ok(c_path) = std::ffi::CString::new(self.root_path.as_os_str().as_encoded_bytes())
        else {
            return false;
        };
        unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
    }
}

//! Runtime configuration
//!
//! Built in three layers: defaults, an optional JSON file (`--config`), then
//! command line flags.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::endpoint::{EndpointError, EndpointMode, EndpointSpec};
use crate::worker::DEFAULT_READ_BUFFER_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Endpoint used when nothing is configured
pub const DEFAULT_ENDPOINT: &str = "tcp://:1935?accept";

/// Per-call acceptor timeout
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Per-step handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long shutdown waits for connections to drain
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const USAGE: &str = "\
Usage: avserv [OPTIONS]

Options:
  --config <path>               JSON configuration file
  --listen <uri|host:port>      Endpoint to accept on (repeatable)
  --accept-timeout-ms <ms>      Acceptor wait per call
  --handshake-timeout-ms <ms>   Handshake step timeout (0 disables)
  -d, --debug                   Debug logging
  -h, --help                    Print this help
";

// ============================================================================
// Server Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Endpoints to bring up, all in accept mode
    pub endpoints: Vec<EndpointSpec>,
    pub accept_timeout: Duration,
    /// `None` lets handshake reads block indefinitely
    pub handshake_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            endpoints: vec![EndpointSpec::accept(None, 1935)],
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// On-disk layout of the JSON configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    endpoints: Option<Vec<String>>,
    accept_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    read_buffer_size: Option<usize>,
    shutdown_grace_ms: Option<u64>,
}

impl ServerConfig {
    /// Parse a JSON document on top of the defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        let mut config = ServerConfig::default();
        config.apply_file(file)?;
        Ok(config)
    }

    /// Load a JSON configuration file on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(endpoints) = file.endpoints {
            self.endpoints = endpoints
                .iter()
                .map(|e| parse_endpoint(e))
                .collect::<Result<_, _>>()?;
        }
        if let Some(ms) = file.accept_timeout_ms {
            self.accept_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.handshake_timeout_ms {
            self.handshake_timeout = handshake_timeout_from_ms(ms);
        }
        if let Some(size) = file.read_buffer_size {
            self.read_buffer_size = size;
        }
        if let Some(ms) = file.shutdown_grace_ms {
            self.shutdown_grace = Duration::from_millis(ms);
        }
        Ok(())
    }

    /// Check the invariants the server relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if let Some(spec) = self
            .endpoints
            .iter()
            .find(|s| s.mode() != EndpointMode::ListenMultiAccept)
        {
            return Err(ConfigError::NotAcceptMode(spec.to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ZeroReadBuffer);
        }
        Ok(())
    }
}

fn handshake_timeout_from_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Parse a full endpoint URI, or `host:port` as shorthand for an
/// accept-mode endpoint
pub fn parse_endpoint(value: &str) -> Result<EndpointSpec, ConfigError> {
    let spec = if value.contains("://") {
        EndpointSpec::parse(value)
    } else {
        EndpointSpec::parse(&format!("tcp://{}?accept", value))
    };
    spec.map_err(ConfigError::Endpoint)
}

// ============================================================================
// Command Line
// ============================================================================

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config: ServerConfig,
    pub debug: bool,
    pub help: bool,
}

impl CliArgs {
    /// Parse `args` (including the program name at index 0), load the
    /// configuration file if one is named, and validate the result.
    pub fn parse(args: &[String]) -> Result<Self, ConfigError> {
        let help = has_flag(args, "-h") || has_flag(args, "--help");
        let debug = has_flag(args, "-d") || has_flag(args, "--debug");
        if help {
            return Ok(CliArgs {
                config: ServerConfig::default(),
                debug,
                help,
            });
        }

        let mut config = match required_arg(args, "--config")? {
            Some(path) => ServerConfig::from_file(Path::new(&path))?,
            None => ServerConfig::default(),
        };

        let listen = parse_arg_all(args, "--listen")?;
        if !listen.is_empty() {
            config.endpoints = listen
                .iter()
                .map(|e| parse_endpoint(e))
                .collect::<Result<_, _>>()?;
        }
        if let Some(ms) = parse_number(args, "--accept-timeout-ms")? {
            config.accept_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(args, "--handshake-timeout-ms")? {
            config.handshake_timeout = handshake_timeout_from_ms(ms);
        }

        config.validate()?;
        Ok(CliArgs {
            config,
            debug,
            help,
        })
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().skip(1).any(|a| a == flag)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Like [`parse_arg`], but a flag without a value is an error
fn required_arg(args: &[String], flag: &str) -> Result<Option<String>, ConfigError> {
    match parse_arg(args, flag) {
        Some(value) => Ok(Some(value)),
        None if has_flag(args, flag) => Err(ConfigError::MissingValue(flag.to_string())),
        None => Ok(None),
    }
}

/// Every value given to a repeatable flag, in order
fn parse_arg_all(args: &[String], flag: &str) -> Result<Vec<String>, ConfigError> {
    let mut values = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        if arg == flag {
            let value = args
                .get(i + 1)
                .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))?;
            values.push(value.clone());
        }
    }
    Ok(values)
}

fn parse_number(args: &[String], flag: &str) -> Result<Option<u64>, ConfigError> {
    match required_arg(args, flag)? {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                flag: flag.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    Io { path: PathBuf, source: io::Error },
    /// Configuration file is not valid JSON for this schema
    Parse(serde_json::Error),
    Endpoint(EndpointError),
    MissingValue(String),
    InvalidValue { flag: String, value: String },
    NoEndpoints,
    /// Server endpoints must be in accept mode
    NotAcceptMode(String),
    ZeroReadBuffer,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "invalid config: {}", e),
            ConfigError::Endpoint(e) => write!(f, "{}", e),
            ConfigError::MissingValue(flag) => write!(f, "{} requires a value", flag),
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value '{}' for {}", value, flag)
            }
            ConfigError::NoEndpoints => write!(f, "no endpoints configured"),
            ConfigError::NotAcceptMode(spec) => {
                write!(f, "endpoint {} is not in accept mode", spec)
            }
            ConfigError::ZeroReadBuffer => write!(f, "read_buffer_size must be positive"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Endpoint(e) => Some(e),
            _ => None,
        }
    }
}

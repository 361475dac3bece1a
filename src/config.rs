//! Configuration for redstream
//!
//! Configuration is loaded from a TOML file with three sections:
//! `[streams]` (identifiers, trimming and consumer tuning),
//! `[connections.<name>]` (one entry per backend connection) and
//! `[logging]`. Every field has a default, so an empty file is valid.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{Result, StreamError};
use crate::types::MaxLen;

/// Name of the connection used when none is configured.
pub const DEFAULT_CONNECTION: &str = "streams";

/// Prefix that marks a named custom stream inside `[streams]`.
pub const CUSTOM_STREAM_PREFIX: &str = "stream_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stream identifiers and consumer tuning
    pub streams: StreamsConfig,

    /// Backend connections by name
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert(DEFAULT_CONNECTION.to_string(), ConnectionConfig::default());
        Self {
            streams: StreamsConfig::default(),
            connections,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Configuration(format!("failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| StreamError::Configuration(format!("failed to parse config: {}", e)))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StreamError::Configuration(format!("failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.streams.validate()?;

        let connection = self.connection()?;
        connection.backend_kind()?;
        if connection.port == 0 {
            return Err(StreamError::Configuration(
                "connection port cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The connection selected by `streams.connection`.
    pub fn connection(&self) -> Result<&ConnectionConfig> {
        let name = &self.streams.connection;
        self.connections.get(name).ok_or_else(|| {
            StreamError::Configuration(format!(
                "connection '{}' is not defined under [connections]",
                name
            ))
        })
    }
}

/// What the consume loop does after a non-connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsumeErrorPolicy {
    /// Return the failure from `consume` so a process supervisor restarts the worker.
    #[default]
    Exit,

    /// Log the failure, back off and keep polling.
    Continue,
}

/// Stream identifiers, producer trimming and consumer loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Default stream name
    pub stream: String,

    /// Default consumer group
    pub consumer_group: String,

    /// Default consumer name within the group
    pub consumer_name: String,

    /// Cap the stream length on every append (unset = no cap)
    pub max_length: Option<usize>,

    /// Trim exactly (`MAXLEN N`) instead of approximately (`MAXLEN ~ N`)
    pub use_exact_maxlen: bool,

    /// Seconds to sleep between poll cycles
    pub poll_interval: f64,

    /// Deliveries an entry gets before it is discarded
    pub retry_limit: u64,

    /// Entries read per poll cycle
    pub batch_size: usize,

    /// Block the group read for up to this many milliseconds (0 = no block)
    pub block_ms: Option<u64>,

    /// Pending records inspected per reclaim pass
    pub reclaim_page_size: usize,

    /// Policy for non-connection failures in the consume loop
    pub on_consume_error: ConsumeErrorPolicy,

    /// Name of the entry in `[connections]` to use
    pub connection: String,

    /// Named custom streams (`stream_<name> = "<stream key>"`)
    #[serde(flatten)]
    pub custom: BTreeMap<String, String>,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            stream: "default_stream".to_string(),
            consumer_group: "default_group".to_string(),
            consumer_name: "default_consumer".to_string(),
            max_length: None,
            use_exact_maxlen: false,
            poll_interval: 1.0,
            retry_limit: 3,
            batch_size: 10,
            block_ms: None,
            reclaim_page_size: 10,
            on_consume_error: ConsumeErrorPolicy::Exit,
            connection: DEFAULT_CONNECTION.to_string(),
            custom: BTreeMap::new(),
        }
    }
}

impl StreamsConfig {
    /// Validate identifiers and tuning values.
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("stream", &self.stream),
            ("consumer_group", &self.consumer_group),
            ("consumer_name", &self.consumer_name),
        ] {
            if value.is_empty() {
                return Err(StreamError::Configuration(format!(
                    "streams.{} cannot be empty",
                    label
                )));
            }
        }

        if self.batch_size == 0 {
            return Err(StreamError::Configuration(
                "streams.batch_size must be at least 1".to_string(),
            ));
        }
        if self.retry_limit == 0 {
            return Err(StreamError::Configuration(
                "streams.retry_limit must be at least 1".to_string(),
            ));
        }
        if self.reclaim_page_size == 0 {
            return Err(StreamError::Configuration(
                "streams.reclaim_page_size must be at least 1".to_string(),
            ));
        }
        if !self.poll_interval.is_finite() || self.poll_interval < 0.0 {
            return Err(StreamError::Configuration(format!(
                "streams.poll_interval must be a non-negative number of seconds, got {}",
                self.poll_interval
            )));
        }
        if self.max_length == Some(0) {
            return Err(StreamError::Configuration(
                "streams.max_length must be greater than 0 when set".to_string(),
            ));
        }

        for (key, stream) in &self.custom {
            if !key.starts_with(CUSTOM_STREAM_PREFIX) || key.len() == CUSTOM_STREAM_PREFIX.len() {
                return Err(StreamError::Configuration(format!(
                    "unknown key streams.{}",
                    key
                )));
            }
            if stream.is_empty() {
                return Err(StreamError::Configuration(format!(
                    "streams.{} cannot be empty",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Length cap producers apply on append, if any.
    pub fn trim_policy(&self) -> Option<MaxLen> {
        match self.max_length {
            Some(n) if n > 0 && self.use_exact_maxlen => Some(MaxLen::exact(n)),
            Some(n) if n > 0 => Some(MaxLen::approximate(n)),
            _ => None,
        }
    }

    /// Sleep between poll cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval.max(0.0))
    }

    /// Group read block time, if blocking reads are enabled.
    pub fn block(&self) -> Option<Duration> {
        self.block_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Custom streams keyed by their short name (`stream_orders` -> `orders`).
    pub fn custom_streams(&self) -> BTreeMap<String, String> {
        self.custom
            .iter()
            .filter_map(|(key, stream)| {
                key.strip_prefix(CUSTOM_STREAM_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), stream.clone()))
            })
            .collect()
    }
}

/// Settings for one backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Backend driver: `native` or `library`
    pub driver: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// ACL username
    pub username: Option<String>,

    /// Password for AUTH
    pub password: Option<String>,

    /// Database index to SELECT on connect
    pub database: u16,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            driver: BackendKind::Native.as_str().to_string(),
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            connect_timeout_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    /// `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the configured driver name.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        BackendKind::from_str(&self.driver)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}

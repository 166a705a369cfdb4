//! Channel Controller configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default; a value that is present but unparsable is an error rather than
//! being silently replaced by the default.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default listener address for WebSocket, health and metrics.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8787";

/// Default maximum concurrent channels.
pub const DEFAULT_MAX_CHANNELS: usize = 1000;

/// Default maximum members in one channel.
pub const DEFAULT_MAX_MEMBERS_PER_CHANNEL: usize = 256;

/// Default seconds of silence before a connection is treated as gone.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 60;

/// Default per-connection outbound queue depth.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 200;

/// Default seconds to wait for in-flight work on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 5;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "cc";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidValue(format!(
                "CC_LOG_FORMAT must be 'text' or 'json', got '{other}'"
            ))),
        }
    }
}

/// Channel Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener address (default: "0.0.0.0:8787").
    pub bind_address: SocketAddr,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// Maximum concurrent channels.
    pub max_channels: usize,

    /// Maximum members per channel.
    pub max_members_per_channel: usize,

    /// Silence after which a connection is disconnected.
    pub idle_timeout: Duration,

    /// Outbound queue depth per connection.
    pub outbound_buffer: usize,

    /// Grace period for in-flight work on shutdown.
    pub shutdown_grace: Duration,

    /// Log output format.
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = parse_or(vars, "CC_BIND_ADDRESS", || {
            SocketAddr::from_str(DEFAULT_BIND_ADDRESS)
                .map_err(|e| ConfigError::InvalidValue(format!("default bind address: {e}")))
        })?;

        let max_channels = positive(vars, "CC_MAX_CHANNELS", DEFAULT_MAX_CHANNELS)?;
        let max_members_per_channel = positive(
            vars,
            "CC_MAX_MEMBERS_PER_CHANNEL",
            DEFAULT_MAX_MEMBERS_PER_CHANNEL,
        )?;
        let idle_timeout_seconds =
            positive(vars, "CC_IDLE_TIMEOUT_SECONDS", DEFAULT_IDLE_TIMEOUT_SECONDS)?;
        let outbound_buffer = positive(vars, "CC_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        let shutdown_grace_seconds: u64 = parse_or(vars, "CC_SHUTDOWN_GRACE_SECONDS", || {
            Ok(DEFAULT_SHUTDOWN_GRACE_SECONDS)
        })?;

        let log_format = match vars.get("CC_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };

        // Generate instance ID
        let instance_id = vars.get("CC_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            instance_id,
            max_channels,
            max_members_per_channel,
            idle_timeout: Duration::from_secs(idle_timeout_seconds),
            outbound_buffer,
            shutdown_grace: Duration::from_secs(shutdown_grace_seconds),
            log_format,
        })
    }
}

fn parse_or<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: impl FnOnce() -> Result<T, ConfigError>,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}='{raw}': {e}"))),
        None => default(),
    }
}

fn positive<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_or(vars, name, || Ok(default))?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(value)
}

//! Server configuration loading from file and environment variables.

use isle_types::DeliveryMode;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "isle_bus=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// NATS server URL.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// JetStream stream holding every isle subject.
    #[serde(default = "default_stream")]
    pub stream: String,

    /// `direct` publishes after commit; `outbox` relays from the outbox table.
    #[serde(default, deserialize_with = "deserialize_delivery_mode")]
    pub delivery_mode: DeliveryMode,

    #[serde(default = "default_relay_interval_ms")]
    pub relay_interval_ms: u64,

    #[serde(default = "default_relay_batch_size")]
    pub relay_batch_size: usize,

    /// Dead-letter a delivery after this many failed attempts. Unset means
    /// redeliver forever.
    #[serde(default)]
    pub max_deliveries: Option<u64>,
}

/// Identity of this service on the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name; the queue group is derived from it.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Whether to run replica listeners for subjects owned elsewhere.
    #[serde(default = "default_replicate")]
    pub replicate: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "isle.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bus_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_stream() -> String {
    isle_bus::nats::DEFAULT_STREAM_NAME.to_string()
}

fn default_relay_interval_ms() -> u64 {
    1_000
}

fn default_relay_batch_size() -> usize {
    100
}

fn default_service_name() -> String {
    isle_types::COURSE_AUTHORING_SERVICE.to_string()
}

fn default_replicate() -> bool {
    true
}

fn deserialize_delivery_mode<'de, D>(deserializer: D) -> Result<DeliveryMode, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let label = String::deserialize(deserializer)?;
    label.parse().map_err(serde::de::Error::custom)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            stream: default_stream(),
            delivery_mode: DeliveryMode::default(),
            relay_interval_ms: default_relay_interval_ms(),
            relay_batch_size: default_relay_batch_size(),
            max_deliveries: None,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            replicate: default_replicate(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override held an unusable value.
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `ISLE_HOST` overrides `server.host`
/// - `ISLE_PORT` overrides `server.port`
/// - `ISLE_DB_PATH` overrides `database.path`
/// - `ISLE_LOG_LEVEL` overrides `logging.level`
/// - `ISLE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `ISLE_BUS_URL` overrides `bus.url`
/// - `ISLE_DELIVERY_MODE` overrides `bus.delivery_mode`
/// - `ISLE_SERVICE_NAME` overrides `service.name`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if `ISLE_DELIVERY_MODE` names an unknown mode.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    Ok(config)
}

/// Applies `ISLE_*` overrides read through `lookup`.
fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = lookup("ISLE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("ISLE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = lookup("ISLE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("ISLE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("ISLE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = lookup("ISLE_BUS_URL") {
        config.bus.url = url;
    }
    if let Some(mode) = lookup("ISLE_DELIVERY_MODE") {
        config.bus.delivery_mode = mode.parse().map_err(|_| ConfigError::InvalidEnv {
            var: "ISLE_DELIVERY_MODE",
            value: mode,
        })?;
    }
    if let Some(name) = lookup("ISLE_SERVICE_NAME") {
        config.service.name = name;
    }
    Ok(())
}

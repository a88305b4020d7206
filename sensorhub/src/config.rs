//! Configuration for the SensorHub service.
//!
//! Settings are layered: built-in defaults, then an optional JSON5 file,
//! then environment variables (see [`ServiceConfig::apply_env`]).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use sensorhub_common::{LoggingConfig, parse_flag};

/// Environment variable selecting simulated sensors.
pub const ENV_MOCK_SENSORS: &str = "MOCK_SENSORS";
/// Environment variable with the sensor's BCM GPIO pin.
pub const ENV_DHT_PIN: &str = "DHT_PIN";
/// Environment variable with the HTTP port.
pub const ENV_PORT: &str = "PORT";
/// Environment variable with the ThingSpeak write API key.
pub const ENV_THINGSPEAK_API_KEY: &str = "THINGSPEAK_API_KEY";
/// Environment variable with the ThingSpeak channel id.
pub const ENV_THINGSPEAK_CHANNEL_ID: &str = "THINGSPEAK_CHANNEL_ID";
/// Environment variable with the ingestion base URL.
pub const ENV_THINGSPEAK_URL: &str = "THINGSPEAK_URL";
/// Environment variable with the publish interval in seconds.
pub const ENV_PUBLISH_INTERVAL: &str = "PUBLISH_INTERVAL";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] sensorhub_common::Error),
    #[error("Invalid value {value:?} for {var}: {message}")]
    Env {
        var: &'static str,
        value: String,
        message: String,
    },
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Sensor selection.
    #[serde(default)]
    pub sensor: SensorConfig,

    /// Ingestion endpoint settings.
    #[serde(default)]
    pub thingspeak: ThingSpeakConfig,

    /// Host metrics settings.
    #[serde(default)]
    pub system: SystemConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind (default: "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on (default: 5000).
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Socket address the HTTP server binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| {
                ConfigError::Validation(format!(
                    "Invalid listen address: {}:{}",
                    self.host, self.port
                ))
            })
    }
}

/// Sensor selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Use simulated readings instead of hardware (default: true).
    #[serde(default = "default_true")]
    pub mock: bool,

    /// BCM GPIO pin the DHT11 data line is wired to (default: 4).
    #[serde(default = "default_dht_pin")]
    pub dht_pin: u8,

    /// Directory holding IIO devices (default: "/sys/bus/iio/devices").
    #[serde(default = "default_iio_root")]
    pub iio_root: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_dht_pin() -> u8 {
    4
}

fn default_iio_root() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices")
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            mock: true,
            dht_pin: default_dht_pin(),
            iio_root: default_iio_root(),
        }
    }
}

/// ThingSpeak publishing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThingSpeakConfig {
    /// Write API key. Empty disables publishing (default: "").
    #[serde(default)]
    pub api_key: String,

    /// Channel id, used only to build the public channel URL.
    #[serde(default)]
    pub channel_id: Option<String>,

    /// Base URL of the ingestion API (default: "https://api.thingspeak.com").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Seconds to sleep between publish cycles (default: 20).
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,

    /// Timeout for a single update request in seconds (default: 10).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.thingspeak.com".to_string()
}

fn default_publish_interval() -> u64 {
    20
}

fn default_timeout() -> u64 {
    10
}

impl Default for ThingSpeakConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            channel_id: None,
            base_url: default_base_url(),
            publish_interval_secs: default_publish_interval(),
            timeout_secs: default_timeout(),
        }
    }
}

impl ThingSpeakConfig {
    /// Whether publishing is enabled (an API key is configured).
    pub fn enabled(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Public URL of the configured channel, if any.
    pub fn channel_url(&self) -> Option<String> {
        self.channel_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| format!("https://thingspeak.com/channels/{}", id))
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Host metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// File holding the CPU temperature in millidegrees Celsius.
    #[serde(default = "default_thermal_path")]
    pub thermal_path: PathBuf,
}

fn default_thermal_path() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            thermal_path: default_thermal_path(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ServiceConfig = sensorhub_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = sensorhub_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an environment lookup, then re-validate.
    ///
    /// Variables that are unset leave the current value untouched.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MOCK_SENSORS) {
            self.sensor.mock = parse_flag(&value);
        }

        if let Some(value) = lookup(ENV_DHT_PIN) {
            self.sensor.dht_pin = parse_env(ENV_DHT_PIN, &value)?;
        }

        if let Some(value) = lookup(ENV_PORT) {
            self.server.port = parse_env(ENV_PORT, &value)?;
        }

        if let Some(value) = lookup(ENV_THINGSPEAK_API_KEY) {
            self.thingspeak.api_key = value;
        }

        if let Some(value) = lookup(ENV_THINGSPEAK_CHANNEL_ID) {
            self.thingspeak.channel_id = Some(value).filter(|id| !id.is_empty());
        }

        if let Some(value) = lookup(ENV_THINGSPEAK_URL) {
            self.thingspeak.base_url = value;
        }

        if let Some(value) = lookup(ENV_PUBLISH_INTERVAL) {
            self.thingspeak.publish_interval_secs = parse_env(ENV_PUBLISH_INTERVAL, &value)?;
        }

        self.validate()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thingspeak.publish_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "publish_interval_secs must be > 0".to_string(),
            ));
        }

        if self.thingspeak.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if !self.thingspeak.base_url.starts_with("http://")
            && !self.thingspeak.base_url.starts_with("https://")
        {
            return Err(ConfigError::Validation(format!(
                "Invalid ThingSpeak URL: {}",
                self.thingspeak.base_url
            )));
        }

        self.server.listen_addr()?;

        Ok(())
    }
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        value: value.to_string(),
        message: e.to_string(),
    })
}

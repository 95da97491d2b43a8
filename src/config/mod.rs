use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::feed::BrokerAddr;

/// Environment variable holding the spreadsheet bearer token.
pub const TOKEN_ENV: &str = "CO2_SHEETS_TOKEN";

/// Top-level configuration, usually read from a TOML file and then
/// overridden by command line flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub destination: DestinationConfig,
}

/// Sensor attachment and sampling.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    /// Serial device path or `tcp://host:port`. Default: "/dev/ttyAMA0".
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Serial line speed. Default: 9600.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Stream id of produced readings, also the topic they are published on.
    /// Default: "/co2/1".
    #[serde(default = "default_topic")]
    pub stream_id: String,

    /// Default: 1s.
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Deadline for one request/response exchange. Default: 5s.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Echo every reading to stdout.
    #[serde(default)]
    pub stdout: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            baud_rate: default_baud_rate(),
            stream_id: default_topic(),
            sample_interval: default_sample_interval(),
            read_timeout: default_read_timeout(),
            stdout: false,
        }
    }
}

/// MQTT broker connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
    /// Default: "tcp://localhost:1883".
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Topic filter to subscribe to; wildcards allowed. Default: "/co2/1".
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Default: 30s.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            topic: default_topic(),
            client_id: default_client_id(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// What the recorder does when an append fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnDestinationError {
    /// Stop the recorder.
    #[default]
    Fail,
    /// Retry with backoff, then stop.
    Retry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per append including the first. Default: 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Default: 1s.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Default: 1m.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Aggregation and flushing.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecorderConfig {
    /// Default: 5m.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Prepended to the last topic segment to name a stream's sheet.
    /// Default: "sheet".
    #[serde(default = "default_sheet_prefix")]
    pub sheet_prefix: String,

    /// Row assumed for streams seen for the first time. Default: unknown.
    #[serde(default)]
    pub initial_row: Option<u32>,

    /// Inbound channel capacity. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Echo every accepted reading to stdout.
    #[serde(default)]
    pub stdout: bool,

    /// Flush buffered windows once more when shutting down. Default: true.
    #[serde(default = "default_true")]
    pub flush_on_shutdown: bool,

    /// When polling the sensor directly, also publish every reading to the
    /// feed broker.
    #[serde(default)]
    pub republish: bool,

    #[serde(default)]
    pub on_destination_error: OnDestinationError,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            sheet_prefix: default_sheet_prefix(),
            initial_row: None,
            channel_capacity: default_channel_capacity(),
            stdout: false,
            flush_on_shutdown: true,
            republish: false,
            on_destination_error: OnDestinationError::Fail,
            retry: RetryConfig::default(),
        }
    }
}

/// Spreadsheet destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    #[serde(default)]
    pub spreadsheet_id: String,

    /// Default: "https://sheets.googleapis.com".
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token. Prefer `access_token_file` or the environment.
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub access_token_file: Option<PathBuf>,

    /// Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            endpoint: default_endpoint(),
            access_token: None,
            access_token_file: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl DestinationConfig {
    /// Bearer token from, in order: the config value, the token file, or
    /// the `CO2_SHEETS_TOKEN` environment variable.
    pub fn resolve_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = self.access_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }

        if let Some(path) = &self.access_token_file {
            let token = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let token = token.trim();
            if token.is_empty() {
                return Err(ConfigError::Invalid(format!("token file {} is empty", path.display())));
            }
            return Ok(token.to_string());
        }

        match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(ConfigError::Invalid(format!(
                "no access token: set destination.access_token, \
                 destination.access_token_file or {TOKEN_ENV}"
            ))),
        }
    }
}

impl Config {
    /// Read and parse a TOML file. Validation is left to the caller, since
    /// command line overrides are applied afterwards.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    /// Checks shared by every command.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensor.transport.is_empty() {
            return Err(invalid("sensor.transport is required"));
        }
        if self.sensor.sample_interval.is_zero() {
            return Err(invalid("sensor.sample_interval must be positive"));
        }
        if self.sensor.read_timeout.is_zero() {
            return Err(invalid("sensor.read_timeout must be positive"));
        }
        if self.sensor.stream_id.is_empty() {
            return Err(invalid("sensor.stream_id is required"));
        }

        BrokerAddr::parse(&self.feed.broker)?;
        if self.feed.topic.is_empty() {
            return Err(invalid("feed.topic is required"));
        }
        if self.feed.keep_alive < Duration::from_secs(5) {
            return Err(invalid("feed.keep_alive must be at least 5s"));
        }

        if self.recorder.flush_interval.is_zero() {
            return Err(invalid("recorder.flush_interval must be positive"));
        }
        if self.recorder.channel_capacity == 0 {
            return Err(invalid("recorder.channel_capacity must be positive"));
        }
        if self.recorder.initial_row == Some(0) {
            return Err(invalid("recorder.initial_row starts at 1"));
        }
        if self.recorder.on_destination_error == OnDestinationError::Retry {
            let retry = &self.recorder.retry;
            if retry.max_attempts == 0 {
                return Err(invalid("recorder.retry.max_attempts must be positive"));
            }
            if retry.base_delay > retry.max_delay {
                return Err(invalid("recorder.retry.base_delay exceeds max_delay"));
            }
        }

        Ok(())
    }

    /// Extra checks when rows go to the real spreadsheet.
    pub fn validate_destination(&self) -> Result<(), ConfigError> {
        if self.destination.spreadsheet_id.is_empty() {
            return Err(invalid("destination.spreadsheet_id is required"));
        }
        if self.destination.request_timeout.is_zero() {
            return Err(invalid("destination.request_timeout must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

fn default_transport() -> String {
    "/dev/ttyAMA0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_topic() -> String {
    "/co2/1".to_string()
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_broker() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "co2-recorder".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_sheet_prefix() -> String {
    "sheet".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

use crate::error::ConfigError;
use qa_core::telemetry_wire::DEFAULT_MAX_FRAME_BYTES;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws/telemetry";
pub const DEFAULT_CLIENT_NAME: &str = "qa-pulse";

/// Runtime settings for a [`crate::TelemetryEngine`].
///
/// Values come from, in increasing precedence: built-in defaults, an optional
/// TOML file, `QA_PULSE_*` environment variables, and whatever the caller
/// sets afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub url: String,
    pub client_id: String,
    pub client_name: String,
    pub supports_compression: bool,
    pub ping_interval_ms: u64,
    pub cleanup_interval_secs: u64,
    pub test_retention_secs: u64,
    pub notification_retention_secs: u64,
    pub max_notifications: usize,
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            client_id: format!("qa-pulse-{}", std::process::id()),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            supports_compression: true,
            ping_interval_ms: 30_000,
            cleanup_interval_secs: 60,
            test_retention_secs: 60 * 60,
            notification_retention_secs: 10 * 60,
            max_notifications: 100,
            max_reconnect_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl TelemetryConfig {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: TelemetryConfig = toml::from_str(raw).map_err(|err| ConfigError::Parse {
            path: origin.to_string(),
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_toml_str(&raw, &path.display().to_string())
    }

    /// Overlays `QA_PULSE_*` values read through `lookup`. Blank values are
    /// treated as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = read("QA_PULSE_URL") {
            self.url = value.trim().to_string();
        }
        if let Some(value) = read("QA_PULSE_CLIENT_ID") {
            self.client_id = value.trim().to_string();
        }
        if let Some(value) = read("QA_PULSE_CLIENT_NAME") {
            self.client_name = value.trim().to_string();
        }
        if let Some(value) = read("QA_PULSE_COMPRESSION") {
            self.supports_compression = parse_bool_flag(&value).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "QA_PULSE_COMPRESSION".to_string(),
                    reason: format!("expected a boolean flag, got '{value}'"),
                }
            })?;
        }
        if let Some(value) = read("QA_PULSE_PING_INTERVAL_MS") {
            self.ping_interval_ms = parse_number("QA_PULSE_PING_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read("QA_PULSE_CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval_secs = parse_number("QA_PULSE_CLEANUP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read("QA_PULSE_TEST_RETENTION_SECS") {
            self.test_retention_secs = parse_number("QA_PULSE_TEST_RETENTION_SECS", &value)?;
        }
        if let Some(value) = read("QA_PULSE_NOTIFICATION_RETENTION_SECS") {
            self.notification_retention_secs =
                parse_number("QA_PULSE_NOTIFICATION_RETENTION_SECS", &value)?;
        }
        if let Some(value) = read("QA_PULSE_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = parse_number("QA_PULSE_MAX_RECONNECT_ATTEMPTS", &value)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if self.client_id.trim().is_empty() {
            return Err(invalid("client_id", "must not be empty"));
        }
        for (key, value) in [
            ("ping_interval_ms", self.ping_interval_ms),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("initial_backoff_ms", self.initial_backoff_ms),
            ("max_backoff_ms", self.max_backoff_ms),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid("max_backoff_ms", "must not be below initial_backoff_ms"));
        }
        if self.max_frame_bytes == 0 {
            return Err(invalid("max_frame_bytes", "must be greater than zero"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(self.url.trim()).map_err(|err| invalid("url", &err.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(invalid("url", &format!("unsupported scheme '{other}'"))),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn test_retention(&self) -> Duration {
        Duration::from_secs(self.test_retention_secs)
    }

    pub fn notification_retention(&self) -> Duration {
        Duration::from_secs(self.notification_retention_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .replace('_', "")
        .parse::<T>()
        .map_err(|err| invalid(key, &format!("'{value}': {err}")))
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

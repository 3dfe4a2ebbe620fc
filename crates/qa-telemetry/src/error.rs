use qa_core::telemetry_wire::FrameError;
use thiserror::Error;

/// Why an inbound notification was dropped before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unrecognized event '{0}'")]
    Unrecognized(String),
    #[error("event '{event}' carries no identifier (tried {tried})")]
    MissingIdentifier { event: String, tried: String },
    #[error("event '{event}' has an invalid payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("telemetry engine is not initialized; call start() first")]
    NotInitialized,
    #[error("telemetry engine already started")]
    AlreadyStarted,
    #[error("telemetry engine has been shut down")]
    ShutDown,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

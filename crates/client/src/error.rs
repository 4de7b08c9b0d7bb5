//! Error types for the sync engine.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures on the wire. All of these end up in the connection supervisor's
/// retry policy; none are surfaced to consumers directly.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid auth header: {0}")]
    InvalidHeader(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Liveness probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Connect refused: {0}")]
    Refused(String),
}

/// Errors returned by `EngineHandle` calls that wait on the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Sync engine stopped")]
    Stopped,
}

/// HTTP health check failures.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Health request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Health endpoint returned HTTP {0}")]
    Status(u16),
}

/// Errors loading client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Home directory not found")]
    NoHomeDir,
}

//! Error types for the Citadel agent

use thiserror::Error;

use crate::auth::DeviceAuthError;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Citadel agent
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker transport error (unreachable, command failed, connection dropped)
    #[error("broker error: {0}")]
    Broker(String),

    /// Malformed message or record that retrying cannot fix
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Resource limit or format violation on inbound data
    #[error("validation error: {0}")]
    Validation(String),

    /// Inference backend error (non-2xx, readiness timeout, bad response)
    #[error("backend error: {0}")]
    Backend(String),

    /// Unknown inference backend requested
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Control-plane API error
    #[error("api error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error and description from the response body
        message: String,
    },

    /// Device authorization error
    #[error("auth error: {0}")]
    Auth(#[from] DeviceAuthError),

    /// Configuration apply error
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Status collection error
    #[error("status error: {0}")]
    Status(String),

    /// Task was cancelled by its supervisor
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Redis error
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl Error {
    /// Whether this error is the intentional-shutdown marker
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

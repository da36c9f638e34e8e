//! Unified error handling for the gateway
//!
//! One error enum for the whole service. Startup errors (configuration) are
//! fatal; connectivity errors feed the reconnect supervisor; everything else
//! is contained where it happens and logged.

use thiserror::Error;

/// Main error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    // ======================================
    // Configuration Errors (fatal at startup)
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ======================================
    // Connectivity Errors (transient, trigger reconnect)
    // ======================================
    #[error("Field protocol connection failed: {endpoint}: {reason}")]
    FieldConnection { endpoint: String, reason: String },

    #[error("Field protocol session is not connected")]
    FieldDisconnected,

    #[error("Storage connection failed: {0}")]
    StorageConnection(String),

    #[error("Storage session is not connected")]
    StorageDisconnected,

    // ======================================
    // Storage & Persistence Errors
    // ======================================
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Persistence cycle failed: {0}")]
    PersistenceCycle(String),

    // ======================================
    // Query Errors (surfaced to HTTP callers)
    // ======================================
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    // ======================================
    // Ambient
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,

            Self::FieldConnection { .. }
            | Self::FieldDisconnected
            | Self::StorageConnection(_)
            | Self::StorageDisconnected
            | Self::Unavailable(_) => 503,

            Self::Configuration(_)
            | Self::MissingConfig(_)
            | Self::Sqlite(_)
            | Self::PersistenceCycle(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => 500,
        }
    }

    /// Check if this error is worth a reconnect attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FieldConnection { .. }
                | Self::FieldDisconnected
                | Self::StorageConnection(_)
                | Self::StorageDisconnected
                | Self::Sqlite(_)
        )
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

//! Error types for handlerkit operations outside a single invocation

use crate::handler::{HandlerError, RegistryError};

/// Result type for handlerkit operations
pub type Result<T> = std::result::Result<T, HandlerKitError>;

/// Error types for the handlerkit framework
///
/// Invocation failures use the richer [`HandlerError`]; this type covers
/// configuration, registry setup and the boundaries around them.
#[derive(Debug, thiserror::Error)]
pub enum HandlerKitError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Registry setup error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Handler resolution or invocation failed
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for HandlerKitError {
    fn from(s: String) -> Self {
        HandlerKitError::Other(s)
    }
}

impl From<&str> for HandlerKitError {
    fn from(s: &str) -> Self {
        HandlerKitError::Other(s.to_string())
    }
}

impl From<figment::Error> for HandlerKitError {
    fn from(err: figment::Error) -> Self {
        HandlerKitError::Configuration(err.to_string())
    }
}

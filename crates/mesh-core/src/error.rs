//! Error types shared across meshgrid crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing config or working with the data model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    ConfigParse(String),

    #[error("invalid duration: {0}")]
    Duration(String),

    #[error("unknown service status code: {0}")]
    UnknownStatus(u8),

    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: crate::ServiceStatus,
        to: crate::ServiceStatus,
    },
}

/// Wire-facing error: a status code plus a human-readable description.
///
/// Every failure that crosses the network is mapped to one of these before
/// it is encoded into a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (status {status})")]
pub struct RequestError {
    pub status: u16,
    pub message: String,
}

impl RequestError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Malformed or unknown request (400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// Requested agent, instance or service type is unknown (404).
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// The peer is reachable but the requested resource is not usable (503).
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    /// Anything else (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

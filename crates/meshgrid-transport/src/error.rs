//! Transport error types.

use std::time::Duration;

use mesh_core::RequestError;
use thiserror::Error;

/// Failures of a connection as a whole.
///
/// Every variant except `Rejected` means the socket is no longer usable and
/// the owner should reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The peer answered, but with a failure status.
    #[error("request rejected: {0}")]
    Rejected(RequestError),
}

impl TransportError {
    /// Whether the connection that produced this error must be replaced.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

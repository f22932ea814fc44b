use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned directly to callers of the session handle.
///
/// Infrastructure failures (start, transport loss, teardown) never show up
/// here; they are handled by the supervisor and surface as status events.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid recipient: {0:?}")]
    InvalidRecipient(String),

    #[error("message text must not be empty")]
    EmptyMessage,

    /// The session actor has stopped (shutdown or runtime teardown).
    #[error("whatsapp session is shut down")]
    Closed,
}

impl SessionError {
    /// True for malformed `send()` arguments.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidRecipient(_) | Self::EmptyMessage)
    }
}

/// Failure while destroying a stale transport handle. Logged, never propagated.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("transport destroy failed: {0}")]
    Destroy(#[from] TransportError),

    #[error("transport destroy timed out after {0:?}")]
    Timeout(std::time::Duration),
}

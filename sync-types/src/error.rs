//! Error types for peerlog entities.

use thiserror::Error;

/// Errors that can occur when decoding peerlog entities.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Persisted message state code is not recognised
    #[error("unknown message state: {0}")]
    UnknownState(u8),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// A message failed validation or was rejected by its delivery hook.
///
/// This is a policy decision, not a system fault: it drives the
/// invalidation cascade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid message: {reason}")]
pub struct InvalidMessage {
    reason: String,
}

impl InvalidMessage {
    /// Create a new rejection with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason the message was rejected.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

//! Error types for sync-store.

use sync_types::{GroupId, MessageId};

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The message does not exist (or was removed with its group).
    #[error("no such message: {0}")]
    NoSuchMessage(MessageId),

    /// The group does not exist (or was removed).
    #[error("no such group: {0}")]
    NoSuchGroup(GroupId),

    /// The message row exists but its body has been erased.
    #[error("message body has been deleted: {0}")]
    MessageDeleted(MessageId),

    /// A write was attempted inside a read-only transaction.
    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl DbError {
    /// Whether the error means an entity was concurrently removed.
    ///
    /// Such errors are benign races for the pipeline: the current item is
    /// skipped and processing continues.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DbError::NoSuchMessage(_) | DbError::NoSuchGroup(_) | DbError::MessageDeleted(_)
        )
    }
}

/// Result type alias for storage operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

//! Contracts implemented by application modules.
//!
//! Each client registers a [`MessageValidator`] to check the messages of its
//! groups and an [`IncomingMessageHook`] to accept them once their
//! dependencies are delivered.

use async_trait::async_trait;
use sync_store::{DbError, MessageStore};
use sync_types::{DeliveryAction, Group, InvalidMessage, Message, MessageContext, Metadata};

/// Checks a message before it enters the dependency graph.
///
/// Validators run on the blocking validation pool, never on the storage
/// worker, so they may perform expensive work such as signature checks.
/// They have no storage access.
pub trait MessageValidator: Send + Sync {
    /// Validate `message` as a member of `group`.
    ///
    /// Returns the metadata to store and the messages this one depends on,
    /// or [`InvalidMessage`] to start the invalidation cascade.
    fn validate_message(
        &self,
        message: &Message,
        group: &Group,
    ) -> Result<MessageContext, InvalidMessage>;
}

/// Errors a delivery hook may return.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// A storage query made by the hook failed. The message is deferred.
    #[error("hook storage error: {0}")]
    Db(#[from] DbError),

    /// The hook judged the message invalid. The message is rejected.
    #[error(transparent)]
    InvalidMessage(#[from] InvalidMessage),
}

/// Decides what happens to a validated message whose dependencies have all
/// been delivered.
///
/// The hook runs on the storage worker inside the pipeline's transaction.
/// It may query and write through `txn`, but must not open another
/// transaction on the same store.
#[async_trait]
pub trait IncomingMessageHook<S: MessageStore>: Send + Sync {
    /// Called once per delivery attempt.
    async fn incoming_message(
        &self,
        txn: &mut S::Txn,
        message: &Message,
        metadata: &Metadata,
    ) -> Result<DeliveryAction, HookError>;
}

//! The transactional storage contract required by the pipeline.

use crate::error::DbResult;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use sync_types::{Group, GroupId, Message, MessageId, MessageState, Metadata};

/// Callback run after a transaction commits successfully.
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// A storage transaction.
///
/// Dropping a transaction without committing it rolls it back and
/// discards any attached callbacks.
pub trait Transaction: Send {
    /// Whether the transaction was opened read-only.
    fn is_read_only(&self) -> bool;

    /// Register a callback that fires only if this transaction commits.
    fn attach(&mut self, callback: CommitCallback);
}

/// Trait for message storage backends.
///
/// All reads and writes for one pipeline step happen inside one
/// transaction. Implementations must give at least read-committed
/// isolation for the read-then-write sequences the pipeline performs.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Transaction type handed to every query and to delivery hooks.
    type Txn: Transaction;

    /// Open a transaction.
    async fn begin(&self, read_only: bool) -> DbResult<Self::Txn>;

    /// Commit a transaction, then run its attached callbacks.
    async fn commit(&self, txn: Self::Txn) -> DbResult<()>;

    /// Messages stored but not yet validated.
    async fn messages_to_validate(&self, txn: &mut Self::Txn) -> DbResult<Vec<MessageId>>;

    /// Messages validated but waiting for delivery.
    async fn pending_messages(&self, txn: &mut Self::Txn) -> DbResult<Vec<MessageId>>;

    /// Delivered, unshared messages that a shared message depends on.
    async fn messages_to_share(&self, txn: &mut Self::Txn) -> DbResult<Vec<MessageId>>;

    /// Load a message.
    ///
    /// Fails with `NoSuchMessage` if absent, `MessageDeleted` if the body
    /// has been erased.
    async fn get_message(&self, txn: &mut Self::Txn, id: &MessageId) -> DbResult<Message>;

    /// Load a group.
    async fn get_group(&self, txn: &mut Self::Txn, id: &GroupId) -> DbResult<Group>;

    /// Current state of a message.
    async fn get_message_state(
        &self,
        txn: &mut Self::Txn,
        id: &MessageId,
    ) -> DbResult<MessageState>;

    /// Set the state of a message.
    async fn set_message_state(
        &self,
        txn: &mut Self::Txn,
        id: &MessageId,
        state: MessageState,
    ) -> DbResult<()>;

    /// States of the messages `id` depends on.
    ///
    /// A dependency that is missing or lives in a different group is
    /// reported as `Unknown`.
    async fn get_message_dependencies(
        &self,
        txn: &mut Self::Txn,
        id: &MessageId,
    ) -> DbResult<HashMap<MessageId, MessageState>>;

    /// States of the messages that depend on `id`.
    async fn get_message_dependents(
        &self,
        txn: &mut Self::Txn,
        id: &MessageId,
    ) -> DbResult<HashMap<MessageId, MessageState>>;

    /// Metadata of a message regardless of its state.
    async fn get_message_metadata_for_validator(
        &self,
        txn: &mut Self::Txn,
        id: &MessageId,
    ) -> DbResult<Metadata>;

    /// Merge metadata into storage. Empty values remove keys.
    async fn merge_message_metadata(
        &self,
        txn: &mut Self::Txn,
        id: &MessageId,
        metadata: &Metadata,
    ) -> DbResult<()>;

    /// Mark a message eligible for re-transmission to peers.
    async fn set_message_shared(&self, txn: &mut Self::Txn, id: &MessageId) -> DbResult<()>;

    /// Erase a message body. The row and its state remain.
    async fn delete_message(&self, txn: &mut Self::Txn, id: &MessageId) -> DbResult<()>;

    /// Erase all metadata of a message.
    async fn delete_message_metadata(&self, txn: &mut Self::Txn, id: &MessageId)
        -> DbResult<()>;

    /// Record dependency edges from `dependent` to each of `dependencies`.
    async fn add_message_dependencies(
        &self,
        txn: &mut Self::Txn,
        dependent: &Message,
        dependencies: &BTreeSet<MessageId>,
    ) -> DbResult<()>;
}

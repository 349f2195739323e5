//! # sync-types
//!
//! Entity types shared by every peerlog crate.
//!
//! This crate provides the data exchanged between the validation pipeline,
//! application modules and the storage layer:
//! - [`MessageId`], [`GroupId`], [`ClientId`], [`ContactId`] - Identity types
//! - [`Message`], [`Group`] - Synced entities
//! - [`MessageState`], [`Metadata`], [`MessageContext`], [`DeliveryAction`] - Pipeline data
//! - [`InvalidMessage`], [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;

pub use error::{InvalidMessage, SyncError};
pub use ids::{ClientId, ClientMajorVersion, ContactId, GroupId, MessageId};
pub use messages::{DeliveryAction, Group, Message, MessageContext, MessageState, Metadata};

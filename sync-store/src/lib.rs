//! # sync-store
//!
//! Storage collaborator for the peerlog validation pipeline.
//!
//! This crate provides:
//! - [`MessageStore`] / [`Transaction`] - the transactional contract the
//!   pipeline is written against
//! - [`EventBus`] - post-commit event delivery ([`Event::MessageAdded`] etc.)
//! - [`SqliteStore`] - a SQLite implementation of the contract
//!
//! ## Transactions
//!
//! ```text
//! begin(read_only) ──► queries / writes ──► commit ──► attached callbacks
//!                                 │
//!                                 └── drop ──► rollback (callbacks discarded)
//! ```
//!
//! Events are attached to the transaction that caused them and broadcast
//! only once that transaction commits, so listeners never hear about data
//! that was rolled back.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
mod sqlite;
mod store;

pub use config::StorageConfig;
pub use error::{DbError, DbResult};
pub use events::{Event, EventBus, EventListener, ListenerId};
pub use sqlite::{SqliteStore, SqliteTransaction};
pub use store::{CommitCallback, MessageStore, Transaction};

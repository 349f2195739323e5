//! # sync-validation
//!
//! Validation, dependency resolution, delivery and sharing pipeline for
//! peerlog.
//!
//! Messages synced from peers arrive as opaque bytes. This crate turns them
//! into trusted, causally ordered deliveries:
//!
//! ```text
//!   peer ──► SqliteStore::receive_message ──► MessageAdded
//!                                                 │
//!        ┌────────────────────────────────────────┘
//!        ▼
//!  ┌───────────────────────────────────────────────────────────┐
//!  │                  ValidationManager                        │
//!  │                                                           │
//!  │  validation pool ──► storage worker ──► delivery hook     │
//!  │  (validators,         (one transaction                    │
//!  │   bounded)             per task)                          │
//!  │                         │      │                          │
//!  │                         ▼      ▼                          │
//!  │                 invalidation  sharing                     │
//!  │                   cascade     cascade                     │
//!  └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A message is `Delivered` only once every dependency is `Delivered`, and
//! never while any dependency is `Invalid`. Progress lives entirely in
//! message state, so [`ValidationManager::start`] resumes whatever a
//! previous process left unfinished.
//!
//! ## Modules
//!
//! - [`manager`] - public API and lifecycle
//! - [`validator`] - contracts implemented by application clients
//! - [`registry`] - validator and hook lookup
//! - [`executor`] - validation pool and in-flight tracking
//! - [`config`] - TOML configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
mod pipeline;
pub mod registry;
pub mod validator;

pub use config::{Config, ConfigError, ValidationConfig};
pub use error::{Result, ValidationError};
pub use executor::{InFlight, PoolError, ValidationPool};
pub use manager::ValidationManager;
pub use registry::Registry;
pub use validator::{HookError, IncomingMessageHook, MessageValidator};

use std::sync::Arc;
use sync_store::{EventBus, SqliteStore};

/// Open the configured database and create a manager for it.
///
/// The returned manager is subscribed to the store's event bus but not yet
/// started.
pub async fn open(config: &Config) -> Result<(Arc<SqliteStore>, ValidationManager<SqliteStore>)> {
    let bus = EventBus::new();
    let store = Arc::new(SqliteStore::new(&config.storage, bus.clone()).await?);
    let manager = ValidationManager::new(Arc::clone(&store), &bus, &config.validation);
    Ok((store, manager))
}

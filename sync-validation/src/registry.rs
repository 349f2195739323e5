//! Validator and hook lookup tables.
//!
//! Keyed by (client, major version). Registration is rare and lookup is hot;
//! lookups clone the `Arc` out so no map guard is held across an await.

use crate::validator::{IncomingMessageHook, MessageValidator};
use dashmap::DashMap;
use std::sync::Arc;
use sync_store::MessageStore;
use sync_types::ClientMajorVersion;

/// Concurrent registry of validators and delivery hooks.
pub struct Registry<S: MessageStore> {
    validators: DashMap<ClientMajorVersion, Arc<dyn MessageValidator>>,
    hooks: DashMap<ClientMajorVersion, Arc<dyn IncomingMessageHook<S>>>,
}

impl<S: MessageStore> Registry<S> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            validators: DashMap::new(),
            hooks: DashMap::new(),
        }
    }

    /// Register a validator. The last registration for a key wins.
    pub fn register_validator(&self, key: ClientMajorVersion, validator: Arc<dyn MessageValidator>) {
        if self.validators.insert(key.clone(), validator).is_some() {
            tracing::debug!("Replaced validator for {}", key);
        } else {
            tracing::debug!("Registered validator for {}", key);
        }
    }

    /// Register a delivery hook. The last registration for a key wins.
    pub fn register_hook(&self, key: ClientMajorVersion, hook: Arc<dyn IncomingMessageHook<S>>) {
        if self.hooks.insert(key.clone(), hook).is_some() {
            tracing::debug!("Replaced delivery hook for {}", key);
        } else {
            tracing::debug!("Registered delivery hook for {}", key);
        }
    }

    /// Look up the validator for a key.
    pub fn validator(&self, key: &ClientMajorVersion) -> Option<Arc<dyn MessageValidator>> {
        self.validators.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up the delivery hook for a key.
    pub fn hook(&self, key: &ClientMajorVersion) -> Option<Arc<dyn IncomingMessageHook<S>>> {
        self.hooks.get(key).map(|entry| Arc::clone(entry.value()))
    }
}

impl<S: MessageStore> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: MessageStore> std::fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("validators", &self.validators.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

//! Event bus for storage notifications.
//!
//! Storage operations attach events to their transaction; the events are
//! broadcast here after the transaction commits. Listeners run on the
//! committing task and must hand work off rather than block.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sync_types::{ContactId, Message, MessageId, MessageState};

/// Notifications broadcast after a transaction commits.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message was stored.
    MessageAdded {
        /// The stored message.
        message: Message,
        /// Contact it was received from; `None` if authored locally.
        origin: Option<ContactId>,
    },
    /// A message changed state.
    MessageStateChanged {
        /// The message.
        message_id: MessageId,
        /// Its new state.
        state: MessageState,
    },
    /// A message became eligible for sharing.
    MessageShared {
        /// The message.
        message_id: MessageId,
    },
}

/// Receives events from an [`EventBus`].
pub trait EventListener: Send + Sync {
    /// Called once per broadcast event.
    fn event_occurred(&self, event: &Event);
}

/// Handle returned by [`EventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Broadcasts events to registered listeners.
///
/// Cheap to clone; clones share the listener set.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Default)]
struct EventBusInner {
    listeners: DashMap<ListenerId, Arc<dyn EventListener>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl EventBus {
    /// Create an event bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.insert(id, listener);
        tracing::debug!("Registered event listener {:?}", id);
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id).is_some()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Deliver an event to every listener.
    pub fn broadcast(&self, event: &Event) {
        // Snapshot first so a listener may (un)register without deadlocking
        let listeners: Vec<Arc<dyn EventListener>> = self
            .inner
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for listener in listeners {
            listener.event_occurred(event);
        }
    }
}

//! Work queue for trampolined graph walks.
//!
//! The pipeline never recurses per dependent. Each cascade (invalidation,
//! sharing, pending delivery, startup sweeps) carries a [`WorkQueue`] of
//! message ids; one id is processed per unit of work and the rest of the
//! queue is handed to the next unit.
//!
//! The queue is FIFO and ignores an id that is already waiting in it, which
//! keeps diamond-shaped graphs from multiplying work. An id that has been
//! popped may be queued again: a pending message can become ready only
//! after its second dependency is delivered.

use std::collections::{HashSet, VecDeque};
use sync_types::MessageId;

/// FIFO queue of message ids with in-queue de-duplication.
#[derive(Debug, Default)]
pub struct WorkQueue {
    /// Ids in processing order.
    queue: VecDeque<MessageId>,
    /// Mirror of `queue` for O(1) membership checks.
    queued: HashSet<MessageId>,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an id to the back of the queue.
    ///
    /// Returns false if the id was already waiting.
    pub fn push(&mut self, id: MessageId) -> bool {
        if self.queued.insert(id) {
            self.queue.push_back(id);
            true
        } else {
            false
        }
    }

    /// Remove and return the next id.
    pub fn pop(&mut self) -> Option<MessageId> {
        let id = self.queue.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    /// Check whether an id is waiting in the queue.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.queued.contains(id)
    }

    /// Number of waiting ids.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Extend<MessageId> for WorkQueue {
    fn extend<I: IntoIterator<Item = MessageId>>(&mut self, iter: I) {
        for id in iter {
            self.push(id);
        }
    }
}

impl FromIterator<MessageId> for WorkQueue {
    fn from_iter<I: IntoIterator<Item = MessageId>>(iter: I) -> Self {
        let mut queue = Self::new();
        queue.extend(iter);
        queue
    }
}

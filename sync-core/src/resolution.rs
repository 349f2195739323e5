//! Dependency resolution decisions.
//!
//! Given the states of a message's dependencies, decide whether the message
//! must be invalidated, must wait, or is ready for its delivery hook. Given
//! the hook's [`DeliveryAction`], decide what happens to the message.
//!
//! The caller (sync-validation) reads the states inside a transaction,
//! asks this module for a decision and applies it in the same transaction.

use sync_types::{DeliveryAction, MessageState};

/// Aggregate view of a message's dependency states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencySummary {
    /// At least one dependency is `Invalid`.
    pub any_invalid: bool,
    /// Every dependency is `Delivered` (true when there are none).
    pub all_delivered: bool,
}

impl DependencySummary {
    /// Summary for a message with no dependencies.
    pub fn none() -> Self {
        Self {
            any_invalid: false,
            all_delivered: true,
        }
    }

    /// Summarise an iterator of dependency states.
    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = MessageState>,
    {
        states.into_iter().fold(Self::none(), |acc, state| Self {
            any_invalid: acc.any_invalid || state == MessageState::Invalid,
            all_delivered: acc.all_delivered && state == MessageState::Delivered,
        })
    }

    /// What the dependencies allow for the dependent message.
    pub fn readiness(&self) -> Readiness {
        if self.any_invalid {
            Readiness::Invalid
        } else if self.all_delivered {
            Readiness::Ready
        } else {
            Readiness::Waiting
        }
    }
}

/// Whether a message may proceed to its delivery hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A dependency is invalid: the message must be invalidated.
    Invalid,
    /// Some dependency is not yet delivered: the message stays pending.
    Waiting,
    /// All dependencies are delivered: call the delivery hook.
    Ready,
}

/// What to do with a ready message once its hook has answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Invalidate the message and cascade to its dependents.
    Invalidate,
    /// Leave the message pending; nothing reschedules it.
    Defer,
    /// Mark the message delivered and re-attempt its pending dependents.
    Deliver {
        /// Also mark the message shared and cascade sharing to its
        /// dependencies.
        share: bool,
    },
}

impl Verdict {
    /// State the message ends in, if the verdict sets one directly.
    ///
    /// `Invalidate` is applied through the invalidation routine, which also
    /// erases the body and metadata, so it has no plain state here.
    pub fn target_state(&self) -> Option<MessageState> {
        match self {
            Verdict::Invalidate => None,
            Verdict::Defer => Some(MessageState::Pending),
            Verdict::Deliver { .. } => Some(MessageState::Delivered),
        }
    }
}

impl From<DeliveryAction> for Verdict {
    fn from(action: DeliveryAction) -> Self {
        match action {
            DeliveryAction::Reject => Verdict::Invalidate,
            DeliveryAction::Defer => Verdict::Defer,
            DeliveryAction::AcceptShare => Verdict::Deliver { share: true },
            DeliveryAction::AcceptDoNotShare => Verdict::Deliver { share: false },
        }
    }
}

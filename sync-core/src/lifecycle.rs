//! Service lifecycle state machine.
//!
//! A validation manager may be started exactly once. Stopping only closes
//! the door on new top-level triggers; queued work keeps draining.

use thiserror::Error;

/// Lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// `start()` was called on a service that has already been started.
    #[error("service has already been started")]
    AlreadyStarted,

    /// `stop()` was called on a service that is not running.
    #[error("service is not running")]
    NotRunning,
}

/// Lifecycle of a single-use service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    /// Constructed, not yet started.
    #[default]
    Created,
    /// Started and accepting events.
    Running,
    /// Stopped; cannot be started again.
    Stopped,
}

impl ServiceState {
    /// Transition to `Running`. Only valid from `Created`.
    pub fn start(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Created => Ok(Self::Running),
            Self::Running | Self::Stopped => Err(LifecycleError::AlreadyStarted),
        }
    }

    /// Transition to `Stopped`. Only valid from `Running`.
    pub fn stop(self) -> Result<Self, LifecycleError> {
        match self {
            Self::Running => Ok(Self::Stopped),
            Self::Created | Self::Stopped => Err(LifecycleError::NotRunning),
        }
    }

    /// Whether new top-level triggers should be accepted.
    pub fn accepts_events(&self) -> bool {
        matches!(self, Self::Running)
    }
}

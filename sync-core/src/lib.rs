//! # sync-core
//!
//! Pure logic for the peerlog validation pipeline (no I/O, instant tests).
//!
//! This crate holds the decisions the pipeline makes, separated from the
//! storage and scheduling that carry them out.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transactions, worker scheduling) is performed by
//! `sync-validation`, which interprets the verdicts produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lifecycle;
pub mod queue;
pub mod resolution;

pub use lifecycle::{LifecycleError, ServiceState};
pub use queue::WorkQueue;
pub use resolution::{DependencySummary, Readiness, Verdict};

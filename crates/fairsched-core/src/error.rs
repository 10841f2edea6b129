//! Error types for each subsystem boundary.
//!
//! Mirrors the teacher's per-boundary style (see `EvidenceDecodeError` in
//! the reference pack): small `thiserror` enums scoped to one API surface
//! rather than one crate-wide error.

use thiserror::Error;

/// Errors surfaced by the alpha/beta lock (C8).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum LockError {
    /// A thread tried to re-enter a group it already holds.
    #[error("recursive acquisition of the same group by the current thread")]
    Recursion,
    /// A thread holding one group tried to acquire the other.
    #[error("cannot acquire the opposite group while holding a lock")]
    InvalidGroupCross,
    /// The lock has been disposed and can no longer be entered.
    #[error("operation attempted on a disposed lock")]
    Disposed,
}

/// Errors surfaced by qdisc scheduling operations (C6/C7).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ScheduleError {
    /// No child matched the handle-based routing path.
    #[error("no route found for handle {0}")]
    NoRoute(u64),
    /// Neither a child predicate nor the root predicate matched the workload.
    #[error("workload matched no classification predicate")]
    ClassificationFailed,
    /// The qdisc has already had `complete()` called on it.
    #[error("operation attempted on a completed qdisc")]
    Disposed,
    /// `add_child` was called with a handle that is already present.
    #[error("child with handle {0} already exists")]
    DuplicateChild(u64),
}

/// Raised by `CancellationFlag::throw_if_cancellation_requested`.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("workload cancellation was requested")]
pub struct CancellationError;

/// Defensive, worker-thread-only fault (§7 "scheduler inconsistency").
///
/// Never returned across an API boundary: constructed, logged via `log::warn!`,
/// and used only to abort the single offending workload.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SchedulerInconsistency {
    /// A dequeued workload was missing its scheduler annotation.
    #[error("workload {0} dequeued without a scheduler annotation")]
    MissingAnnotation(u64),
    /// A child reported non-empty but yielded no candidate after repopulation.
    #[error("child {0} reported data but repopulation failed")]
    StaleEmptinessBit(u64),
}

//! Error types for task submission and execution.

use thiserror::Error;

use crate::types::TaskId;

/// Why a submission was rejected. All variants are recoverable by the
/// caller; none affect already-queued work.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The scheduler has been shut down and accepts no further tasks.
    #[error("scheduler closed")]
    Closed,

    /// Task cost must be a positive number of work units.
    #[error("task {0} has non-positive cost")]
    NonPositiveCost(TaskId),

    /// A task with the same identity was already submitted.
    #[error("duplicate task id {0}")]
    DuplicateId(TaskId),
}

/// Failure raised while executing one task's work.
///
/// Recorded as that task's outcome; never terminates the dispatch loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct WorkError {
    message: String,
}

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

//! Pluggable execution strategy for dispatched tasks.

use std::thread;
use std::time::Duration;

use crate::error::WorkError;
use crate::types::Task;

/// Performs the actual work for one task.
///
/// Implementations run on the dispatch thread, one task at a time. A
/// returned error (or a panic, which the loop catches) becomes that
/// task's outcome and never stops dispatch.
pub trait WorkExecutor: Send + Sync {
    fn execute(&self, task: &Task) -> Result<(), WorkError>;
}

impl<F> WorkExecutor for F
where
    F: Fn(&Task) -> Result<(), WorkError> + Send + Sync,
{
    fn execute(&self, task: &Task) -> Result<(), WorkError> {
        self(task)
    }
}

/// Default strategy: sleep for `cost * unit`, simulating timed work.
pub struct TimedWork {
    unit: Duration,
}

impl TimedWork {
    /// A strategy that sleeps `unit` once per cost unit of each task.
    pub fn new(unit: Duration) -> Self {
        Self { unit }
    }
}

impl WorkExecutor for TimedWork {
    fn execute(&self, task: &Task) -> Result<(), WorkError> {
        thread::sleep(self.unit * task.cost);
        Ok(())
    }
}

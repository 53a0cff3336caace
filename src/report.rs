//! Completion reporting for finished tasks.

use std::time::{Duration, Instant};

use crate::error::WorkError;
use crate::types::TaskId;

/// How a dispatched task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(WorkError),
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

/// Timing record emitted for every task the dispatch loop finishes,
/// whether the work succeeded or failed.
#[derive(Clone, Debug)]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub started: Instant,
    pub completed: Instant,
    /// Completion stamp minus arrival stamp.
    pub turnaround: Duration,
    pub outcome: TaskOutcome,
}

impl CompletionReport {
    /// Time spent executing the work itself (completion minus start).
    pub fn service_time(&self) -> Duration {
        self.completed.duration_since(self.started)
    }
}

/// Receives completion reports from the dispatch loop.
///
/// The scheduler owns no output policy; the driver injects whatever sink
/// it wants (a channel for tests and benchmarks, a logger for a CLI).
/// Sinks run on the dispatch thread and should return quickly.
pub trait CompletionSink: Send + Sync {
    fn report(&self, report: CompletionReport);
}

/// Adapter turning a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> CompletionSink for FnSink<F>
where
    F: Fn(CompletionReport) + Send + Sync,
{
    fn report(&self, report: CompletionReport) {
        (self.0)(report)
    }
}

/// A channel sender works directly as a sink. A disconnected receiver
/// drops the report rather than failing the dispatch loop.
impl CompletionSink for crossbeam_channel::Sender<CompletionReport> {
    fn report(&self, report: CompletionReport) {
        if let Err(err) = self.send(report) {
            tracing::debug!(task = err.0.task_id, "completion receiver gone, report dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn sample_report(task_id: TaskId) -> CompletionReport {
        let started = Instant::now();
        CompletionReport {
            task_id,
            started,
            completed: started + Duration::from_millis(5),
            turnaround: Duration::from_millis(8),
            outcome: TaskOutcome::Completed,
        }
    }

    #[test]
    fn channel_sender_delivers_reports() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink: &dyn CompletionSink = &tx;
        sink.report(sample_report(7));
        let received = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("report not delivered");
        assert_eq!(received.task_id, 7);
    }

    #[test]
    fn channel_sender_tolerates_disconnected_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        // Must not panic; the report is silently dropped.
        tx.report(sample_report(1));
    }

    #[test]
    fn closures_work_as_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = FnSink(|report: CompletionReport| {
            seen.lock().expect("seen mutex poisoned").push(report.task_id);
        });
        sink.report(sample_report(3));
        sink.report(sample_report(4));
        assert_eq!(*seen.lock().expect("seen mutex poisoned"), vec![3, 4]);
    }

    #[test]
    fn service_time_is_completion_minus_start() {
        let report = sample_report(1);
        assert_eq!(report.service_time(), Duration::from_millis(5));
    }
}

//! Single-consumer FIFO scheduler with graceful drain on shutdown.
//!
//! Producers call [`Scheduler::submit`] from any number of threads; one
//! dispatch loop ([`Scheduler::run`]) pops tasks in submission order and
//! executes them serially through the injected [`WorkExecutor`].
//! [`Scheduler::shutdown`] stops intake and lets the backlog drain;
//! [`Scheduler::await_termination`] blocks until the loop has stopped.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{SubmitError, WorkError};
use crate::executor::WorkExecutor;
use crate::report::{CompletionReport, CompletionSink, TaskOutcome};
use crate::types::{Task, TaskId};

/// Lifecycle of the single consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConsumerState {
    NotStarted,
    Running,
    Stopped,
}

/// Everything the producers and the consumer share, guarded by one lock.
///
/// The queue, the accepting flag, and the in-flight counter are always
/// read and updated together under this lock; splitting them across
/// primitives would open a window where the termination condition is
/// observed mid-submit.
struct SchedState {
    queue: VecDeque<Task>,
    accepting: bool,
    in_flight: usize,
    submitted: HashSet<TaskId>,
    consumer: ConsumerState,
}

impl SchedState {
    /// True once the dispatch loop is allowed to terminate.
    fn drained(&self) -> bool {
        !self.accepting && self.queue.is_empty() && self.in_flight == 0
    }
}

/// A FIFO ready queue with a single dispatch loop behind it.
pub struct Scheduler {
    inner: Mutex<SchedState>,
    /// Wakes the dispatch loop: work arrived or shutdown was requested.
    available: Condvar,
    /// Wakes callers blocked in `await_termination`.
    terminated: Condvar,
    executor: Box<dyn WorkExecutor>,
    sink: Box<dyn CompletionSink>,
}

impl Scheduler {
    /// Create a scheduler with the given execution strategy and
    /// completion sink.
    pub fn new(
        executor: impl WorkExecutor + 'static,
        sink: impl CompletionSink + 'static,
    ) -> Self {
        Self {
            inner: Mutex::new(SchedState {
                queue: VecDeque::new(),
                accepting: true,
                in_flight: 0,
                submitted: HashSet::new(),
                consumer: ConsumerState::NotStarted,
            }),
            available: Condvar::new(),
            terminated: Condvar::new(),
            executor: Box::new(executor),
            sink: Box::new(sink),
        }
    }

    /// Append a task to the back of the ready queue and wake the
    /// dispatch loop if it is idle.
    ///
    /// Never blocks beyond the critical section; queue depth is
    /// unbounded. Rejected tasks leave the queue untouched.
    pub fn submit(&self, task: Task) -> Result<(), SubmitError> {
        let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
        if !guard.accepting {
            return Err(SubmitError::Closed);
        }
        if task.cost == 0 {
            return Err(SubmitError::NonPositiveCost(task.id));
        }
        if !guard.submitted.insert(task.id) {
            return Err(SubmitError::DuplicateId(task.id));
        }
        debug!(task = task.id, cost = task.cost, "task queued");
        guard.queue.push_back(task);
        guard.in_flight += 1;
        self.available.notify_one();
        Ok(())
    }

    /// Stop accepting new submissions and let the backlog drain.
    ///
    /// Idempotent and non-blocking; already-queued tasks are never
    /// discarded. Use [`Scheduler::await_termination`] to wait for the
    /// drain to finish.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
        if !guard.accepting {
            return;
        }
        guard.accepting = false;
        debug!(queued = guard.queue.len(), "shutdown requested");
        // With nothing started and nothing queued there is no consumer
        // to observe the drain, so the scheduler is already stopped.
        if guard.consumer == ConsumerState::NotStarted && guard.drained() {
            guard.consumer = ConsumerState::Stopped;
            self.terminated.notify_all();
        }
        self.available.notify_all();
    }

    /// The dispatch loop. Intended to run on its own thread (see
    /// [`Scheduler::spawn`]); returns once the scheduler has shut down
    /// and fully drained.
    ///
    /// Only one loop may run per scheduler; an extra call is a logged
    /// no-op.
    pub fn run(&self) {
        {
            let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
            match guard.consumer {
                ConsumerState::NotStarted => guard.consumer = ConsumerState::Running,
                ConsumerState::Running | ConsumerState::Stopped => {
                    warn!("dispatch loop already claimed, ignoring extra run()");
                    return;
                }
            }
        }
        debug!("dispatch loop started");
        while let Some(task) = self.next_task() {
            self.dispatch(task);
        }
        let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
        guard.consumer = ConsumerState::Stopped;
        debug!("dispatch loop stopped");
        self.terminated.notify_all();
    }

    /// Run the dispatch loop on a named thread.
    pub fn spawn(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        thread::Builder::new()
            .name("dispatch".to_string())
            .spawn(move || scheduler.run())
            .expect("failed to spawn dispatch thread")
    }

    /// Block the calling thread until the dispatch loop has stopped.
    ///
    /// Returns once shutdown was requested and every queued task has
    /// drained. With tasks still queued this waits for a consumer to
    /// drain them, so the driver must have started [`Scheduler::run`].
    pub fn await_termination(&self) {
        let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
        while guard.consumer != ConsumerState::Stopped {
            guard = self.terminated.wait(guard).expect("condvar wait failed");
        }
    }

    /// Number of tasks queued but not yet dispatched.
    pub fn queued(&self) -> usize {
        let guard = self.inner.lock().expect("scheduler mutex poisoned");
        guard.queue.len()
    }

    /// Tasks submitted but not yet completed, including one mid-execution.
    pub fn in_flight(&self) -> usize {
        let guard = self.inner.lock().expect("scheduler mutex poisoned");
        guard.in_flight
    }

    /// Whether submissions are still accepted.
    pub fn is_accepting(&self) -> bool {
        let guard = self.inner.lock().expect("scheduler mutex poisoned");
        guard.accepting
    }

    /// Block until a task is ready or the scheduler has fully drained.
    ///
    /// The wake condition is re-checked under the lock after every wake,
    /// so a submit racing with the wait can neither be lost nor popped
    /// twice, and spurious wakeups are harmless.
    fn next_task(&self) -> Option<Task> {
        let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
        loop {
            if let Some(task) = guard.queue.pop_front() {
                return Some(task);
            }
            if guard.drained() {
                return None;
            }
            // Wait releases the lock and re-acquires it before returning.
            guard = self.available.wait(guard).expect("condvar wait failed");
        }
    }

    /// Execute one task to completion and report it.
    ///
    /// The termination check happens only between dispatches: a task
    /// that has started always runs to completion, even if shutdown was
    /// requested mid-execution. Executor errors and panics are contained
    /// as the task's outcome.
    fn dispatch(&self, mut task: Task) {
        let started = Instant::now();
        task.started = Some(started);
        debug!(task = task.id, priority = task.priority, "executing");

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(&task))) {
            Ok(Ok(())) => TaskOutcome::Completed,
            Ok(Err(err)) => TaskOutcome::Failed(err),
            Err(payload) => TaskOutcome::Failed(WorkError::new(panic_message(payload.as_ref()))),
        };

        let completed = Instant::now();
        task.completed = Some(completed);
        let turnaround = completed.duration_since(task.arrival);

        if let TaskOutcome::Failed(err) = &outcome {
            warn!(task = task.id, error = %err, "task failed, dispatch continues");
        }

        {
            let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
            debug_assert!(guard.in_flight > 0, "in-flight counter underflow");
            guard.in_flight -= 1;
        }

        debug!(
            task = task.id,
            turnaround_us = turnaround.as_micros() as u64,
            "task finished"
        );
        // Report outside the lock; sinks may block briefly.
        self.sink.report(CompletionReport {
            task_id: task.id,
            started,
            completed,
            turnaround,
            outcome,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use std::sync::Barrier;
    use std::time::Duration;

    /// Executor that finishes instantly without doing any work.
    fn noop_executor() -> impl WorkExecutor {
        |_: &Task| -> Result<(), WorkError> { Ok(()) }
    }

    fn channel_scheduler(
        executor: impl WorkExecutor + 'static,
    ) -> (Arc<Scheduler>, Receiver<CompletionReport>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Scheduler::new(executor, tx)), rx)
    }

    fn collect_reports(rx: &Receiver<CompletionReport>, count: usize) -> Vec<CompletionReport> {
        (0..count)
            .map(|_| {
                rx.recv_timeout(Duration::from_secs(2))
                    .expect("missing completion report")
            })
            .collect()
    }

    /// Bounded await_termination so a broken drain fails the test
    /// instead of hanging it.
    fn await_termination_within(scheduler: &Arc<Scheduler>, timeout: Duration) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let scheduler = Arc::clone(scheduler);
        let handle = thread::spawn(move || {
            scheduler.await_termination();
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).expect("scheduler did not terminate");
        handle.join().expect("await thread panicked");
    }

    #[test]
    fn tasks_complete_in_submission_order() {
        let (scheduler, rx) = channel_scheduler(noop_executor());
        // The canonical four: queued before the loop starts.
        scheduler.submit(Task::new(1, 3, 5)).expect("submit 1");
        scheduler.submit(Task::new(2, 1, 3)).expect("submit 2");
        scheduler.submit(Task::new(3, 2, 4)).expect("submit 3");
        scheduler.submit(Task::new(4, 1, 2)).expect("submit 4");

        let handle = scheduler.spawn();
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(2));
        handle.join().expect("dispatch thread panicked");

        let reports = collect_reports(&rx, 4);
        let order: Vec<TaskId> = reports.iter().map(|r| r.task_id).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(reports.iter().all(|r| r.outcome.is_completed()));
        assert!(rx.try_recv().is_err(), "unexpected extra report");
    }

    #[test]
    fn no_task_lost_under_concurrent_producers() {
        let (scheduler, rx) = channel_scheduler(noop_executor());
        let dispatch = scheduler.spawn();

        let producers = 4;
        let tasks_per_producer = 25;
        let barrier = Arc::new(Barrier::new(producers));
        let mut handles = Vec::new();
        for producer in 0..producers {
            let scheduler = Arc::clone(&scheduler);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for seq in 0..tasks_per_producer {
                    let id = (producer as u64) * 1_000 + seq as u64;
                    scheduler
                        .submit(Task::new(id, 0, 1))
                        .expect("submit during accept phase");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("producer thread panicked");
        }

        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(2));
        dispatch.join().expect("dispatch thread panicked");

        let total = producers * tasks_per_producer;
        let reports = collect_reports(&rx, total);
        let mut seen = HashSet::new();
        for report in &reports {
            // Exactly once: no duplicates here, and the count below
            // rules out losses.
            assert!(seen.insert(report.task_id));
        }
        assert_eq!(seen.len(), total);

        // Single consumer: each producer's tasks complete in its own
        // submission order.
        for producer in 0..producers as u64 {
            let sequence: Vec<TaskId> = reports
                .iter()
                .map(|r| r.task_id)
                .filter(|id| id / 1_000 == producer)
                .collect();
            let mut sorted = sequence.clone();
            sorted.sort_unstable();
            assert_eq!(sequence, sorted, "producer {producer} order broken");
        }
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let (scheduler, rx) = channel_scheduler(noop_executor());
        for id in 1..=5 {
            scheduler.submit(Task::new(id, 0, 1)).expect("submit");
        }
        scheduler.shutdown();
        assert_eq!(
            scheduler.submit(Task::new(6, 0, 1)),
            Err(SubmitError::Closed)
        );

        // The backlog still drains even though the loop starts after
        // shutdown was requested.
        let handle = scheduler.spawn();
        await_termination_within(&scheduler, Duration::from_secs(2));
        handle.join().expect("dispatch thread panicked");

        let reports = collect_reports(&rx, 5);
        let order: Vec<TaskId> = reports.iter().map(|r| r.task_id).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert!(rx.try_recv().is_err(), "rejected task was dispatched");
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (scheduler, rx) = channel_scheduler(noop_executor());
        let handle = scheduler.spawn();
        scheduler.submit(Task::new(1, 0, 1)).expect("submit 1");
        scheduler.submit(Task::new(2, 0, 1)).expect("submit 2");

        scheduler.shutdown();
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(2));
        // A third call after the loop stopped must also be harmless.
        scheduler.shutdown();
        handle.join().expect("dispatch thread panicked");

        assert_eq!(collect_reports(&rx, 2).len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn shutdown_on_idle_scheduler_terminates_promptly() {
        let (scheduler, _rx) = channel_scheduler(noop_executor());
        let handle = scheduler.spawn();
        // Give the loop a moment to block on the empty queue, then make
        // sure shutdown wakes it rather than deadlocking.
        thread::sleep(Duration::from_millis(50));
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(1));
        handle.join().expect("dispatch thread panicked");
    }

    #[test]
    fn shutdown_without_consumer_terminates_immediately() {
        let (scheduler, _rx) = channel_scheduler(noop_executor());
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(1));
        // A late run() finds nothing to claim and returns.
        scheduler.run();
    }

    #[test]
    fn submit_after_shutdown_leaves_queue_unchanged() {
        let (scheduler, _rx) = channel_scheduler(noop_executor());
        scheduler.submit(Task::new(1, 0, 1)).expect("submit");
        assert_eq!(scheduler.queued(), 1);
        scheduler.shutdown();
        assert!(!scheduler.is_accepting());
        assert_eq!(
            scheduler.submit(Task::new(2, 0, 1)),
            Err(SubmitError::Closed)
        );
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[test]
    fn invalid_tasks_are_rejected_at_submission() {
        let (scheduler, _rx) = channel_scheduler(noop_executor());
        scheduler.submit(Task::new(1, 0, 1)).expect("submit");
        assert_eq!(
            scheduler.submit(Task::new(1, 0, 2)),
            Err(SubmitError::DuplicateId(1))
        );
        assert_eq!(
            scheduler.submit(Task::new(2, 0, 0)),
            Err(SubmitError::NonPositiveCost(2))
        );
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[test]
    fn work_failures_do_not_stop_dispatch() {
        let executor = |task: &Task| -> Result<(), WorkError> {
            match task.id {
                2 => Err(WorkError::new("injected failure")),
                3 => panic!("boom"),
                _ => Ok(()),
            }
        };
        let (scheduler, rx) = channel_scheduler(executor);
        let handle = scheduler.spawn();
        for id in 1..=4 {
            scheduler.submit(Task::new(id, 0, 1)).expect("submit");
        }
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(2));
        handle.join().expect("dispatch thread panicked");

        let reports = collect_reports(&rx, 4);
        let order: Vec<TaskId> = reports.iter().map(|r| r.task_id).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);

        assert!(reports[0].outcome.is_completed());
        match &reports[1].outcome {
            TaskOutcome::Failed(err) => assert_eq!(err.to_string(), "injected failure"),
            other => panic!("expected failure outcome, got {other:?}"),
        }
        match &reports[2].outcome {
            TaskOutcome::Failed(err) => assert!(err.to_string().contains("boom")),
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert!(reports[3].outcome.is_completed());
    }

    #[test]
    fn turnaround_covers_queue_wait_and_service() {
        let executor = TimedWorkForTest;
        let (scheduler, rx) = channel_scheduler(executor);
        let handle = scheduler.spawn();
        for id in 1..=3 {
            scheduler.submit(Task::new(id, 0, id as u32)).expect("submit");
        }
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(2));
        handle.join().expect("dispatch thread panicked");

        for report in collect_reports(&rx, 3) {
            // completion >= start >= arrival, so turnaround bounds the
            // service time from above.
            assert!(report.completed >= report.started);
            assert!(report.turnaround >= report.service_time());
        }
    }

    /// Small fixed sleep per cost unit, kept test-local so timing stays
    /// well under the recv timeouts.
    struct TimedWorkForTest;

    impl WorkExecutor for TimedWorkForTest {
        fn execute(&self, task: &Task) -> Result<(), WorkError> {
            thread::sleep(Duration::from_millis(task.cost as u64));
            Ok(())
        }
    }

    #[test]
    fn idle_consumer_wakes_on_submit() {
        let (scheduler, rx) = channel_scheduler(noop_executor());
        let handle = scheduler.spawn();
        // Let the loop block on the empty queue first.
        thread::sleep(Duration::from_millis(50));
        scheduler.submit(Task::new(99, 0, 1)).expect("submit");
        let report = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("submit did not wake the consumer");
        assert_eq!(report.task_id, 99);
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(1));
        handle.join().expect("dispatch thread panicked");
    }

    #[test]
    fn second_run_call_is_ignored() {
        let (scheduler, rx) = channel_scheduler(noop_executor());
        let first = scheduler.spawn();
        let second = scheduler.spawn();
        for id in 1..=3 {
            scheduler.submit(Task::new(id, 0, 1)).expect("submit");
        }
        scheduler.shutdown();
        await_termination_within(&scheduler, Duration::from_secs(2));
        first.join().expect("dispatch thread panicked");
        second.join().expect("second dispatch thread panicked");

        // One consumer only: exactly three reports, no duplicates.
        assert_eq!(collect_reports(&rx, 3).len(), 3);
        assert!(rx.try_recv().is_err());
    }
}

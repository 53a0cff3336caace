//! Demo, benchmark, and stress-test runners for the conveyor CLI.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use conveyor::{CompletionReport, Scheduler, SubmitError, Task, TaskId, TimedWork};

// Demo timing knob (small for quick CLI feedback).
const DEMO_WORK_UNIT_MS: u64 = 20;
// Id space reserved per producer in bench/stress runs.
const PRODUCER_ID_STRIDE: u64 = 1_000_000;

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Run the default demo: the four canonical tasks through a timed-work
/// scheduler, then a clean drain.
pub fn run_demo() {
    info!("demo start");

    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler = Arc::new(Scheduler::new(
        TimedWork::new(Duration::from_millis(DEMO_WORK_UNIT_MS)),
        tx,
    ));
    let dispatch = scheduler.spawn();

    // (id, priority, cost); priority is descriptive only.
    let submissions = [(1, 3, 5), (2, 1, 3), (3, 2, 4), (4, 1, 2)];
    let start = Instant::now();
    for (id, priority, cost) in submissions {
        scheduler
            .submit(Task::new(id, priority, cost))
            .expect("queue accepts while open");
        info!(task = id, cost, "submitted");
    }

    scheduler.shutdown();
    let rejected_after_shutdown = matches!(
        scheduler.submit(Task::new(5, 0, 1)),
        Err(SubmitError::Closed)
    );
    scheduler.await_termination();
    dispatch.join().expect("dispatch thread panicked");

    let reports: Vec<CompletionReport> = rx.try_iter().collect();
    let order: Vec<TaskId> = reports.iter().map(|r| r.task_id).collect();
    let expected: Vec<TaskId> = submissions.iter().map(|&(id, _, _)| id).collect();
    let failures = reports
        .iter()
        .filter(|r| !r.outcome.is_completed())
        .count();
    let max_turnaround_ms = reports
        .iter()
        .map(|r| r.turnaround.as_millis())
        .max()
        .unwrap_or(0);

    info!(elapsed_ms = start.elapsed().as_millis() as u64, "demo drained");

    println!("DEMO SUMMARY");
    println!("tasks_completed={}", reports.len());
    println!("completion_order={order:?}");
    println!("fifo_order_preserved={}", order == expected);
    println!("rejected_after_shutdown={rejected_after_shutdown}");
    println!("failures={failures}");
    println!("max_turnaround_ms={max_turnaround_ms}");
}

/// Aggregated metrics from a single benchmark run.
struct BenchResult {
    producers: usize,
    tasks_per_producer: usize,
    cost: u32,
    total_tasks: usize,
    elapsed_ms: f64,
    throughput: f64,
    avg_turnaround_us: f64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    completed: usize,
    failed: usize,
    lost: usize,
    duplicate_tasks: bool,
    fifo_violation: bool,
}

fn benchmark_once(
    producers: usize,
    tasks_per_producer: usize,
    cost: u32,
    unit_us: u64,
    validate: bool,
) -> BenchResult {
    debug_assert!(producers > 0, "producers must be > 0");
    debug_assert!(tasks_per_producer > 0, "tasks_per_producer must be > 0");
    debug_assert!(cost > 0, "cost must be > 0");

    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler = Arc::new(Scheduler::new(
        TimedWork::new(Duration::from_micros(unit_us)),
        tx,
    ));
    let dispatch = scheduler.spawn();

    let total_tasks = producers * tasks_per_producer;
    let barrier = Arc::new(Barrier::new(producers));
    let cpu_start = cpu_times_seconds();
    let start = Instant::now();

    let mut handles = Vec::new();
    for producer in 0..producers {
        let scheduler = Arc::clone(&scheduler);
        let barrier = Arc::clone(&barrier);
        let name = format!("producer-{producer}");
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                barrier.wait();
                for seq in 0..tasks_per_producer {
                    let id = producer as u64 * PRODUCER_ID_STRIDE + seq as u64;
                    scheduler
                        .submit(Task::new(id, 0, cost))
                        .expect("queue accepts while open");
                }
            })
            .expect("failed to spawn producer thread");
        handles.push(handle);
    }
    for handle in handles {
        handle.join().expect("producer thread panicked");
    }

    scheduler.shutdown();
    scheduler.await_termination();
    dispatch.join().expect("dispatch thread panicked");

    let elapsed_ms = start.elapsed().as_millis() as f64;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    // The loop has stopped, so every report is already buffered.
    let reports: Vec<CompletionReport> = rx.try_iter().collect();
    let completed = reports
        .iter()
        .filter(|r| r.outcome.is_completed())
        .count();
    let failed = reports.len() - completed;
    let lost = total_tasks.saturating_sub(reports.len());
    let avg_turnaround_us = if reports.is_empty() {
        0.0
    } else {
        reports
            .iter()
            .map(|r| r.turnaround.as_micros() as f64)
            .sum::<f64>()
            / reports.len() as f64
    };

    let mut duplicate_tasks = false;
    let mut fifo_violation = false;
    if validate {
        let mut seen = HashSet::new();
        for report in &reports {
            if !seen.insert(report.task_id) {
                duplicate_tasks = true;
            }
        }
        // Single consumer dispatches each producer's tasks in that
        // producer's submission order, which here means ascending ids.
        for producer in 0..producers as u64 {
            let mut last: Option<TaskId> = None;
            for id in reports
                .iter()
                .map(|r| r.task_id)
                .filter(|id| id / PRODUCER_ID_STRIDE == producer)
            {
                if let Some(prev) = last {
                    if id <= prev {
                        fifo_violation = true;
                    }
                }
                last = Some(id);
            }
        }
    }

    let throughput = if elapsed_ms > 0.0 {
        (reports.len() as f64) / (elapsed_ms / 1000.0)
    } else {
        0.0
    };

    BenchResult {
        producers,
        tasks_per_producer,
        cost,
        total_tasks,
        elapsed_ms,
        throughput,
        avg_turnaround_us,
        cpu_user_s,
        cpu_sys_s,
        completed,
        failed,
        lost,
        duplicate_tasks,
        fifo_violation,
    }
}

const CSV_HEADER: &str = "producers,tasks_per_producer,cost,total_tasks,elapsed_ms,throughput_tasks_per_s,avg_turnaround_us,cpu_user_s,cpu_sys_s,completed,failed,duplicate_tasks,fifo_violation";

fn print_result_row(result: &BenchResult, validate: bool) {
    let cpu_user = result
        .cpu_user_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    let cpu_sys = result
        .cpu_sys_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    println!(
        "{},{},{},{},{:.2},{:.2},{:.2},{},{},{},{},{},{}",
        result.producers,
        result.tasks_per_producer,
        result.cost,
        result.total_tasks,
        result.elapsed_ms,
        result.throughput,
        result.avg_turnaround_us,
        cpu_user,
        cpu_sys,
        result.completed,
        result.failed,
        result.duplicate_tasks,
        result.fifo_violation
    );
    if result.lost > 0 {
        eprintln!("# warning,lost_tasks,{}", result.lost);
    }
    if validate {
        if result.duplicate_tasks {
            eprintln!("# violation,duplicate_tasks");
        }
        if result.fifo_violation {
            eprintln!("# violation,fifo_order");
        }
    }
}

/// Run a single benchmark with optional parameter overrides.
pub fn run_benchmark(
    producers: Option<usize>,
    tasks_per_producer: Option<usize>,
    cost: Option<u32>,
    unit_us: Option<u64>,
    validate: bool,
) {
    let producers = producers.unwrap_or(4);
    let tasks_per_producer = tasks_per_producer.unwrap_or(25);
    let cost = cost.unwrap_or(1);
    let unit_us = unit_us.unwrap_or(100);
    if producers == 0 {
        eprintln!("benchmark error: producers must be > 0");
        return;
    }
    if tasks_per_producer == 0 {
        eprintln!("benchmark error: tasks_per_producer must be > 0");
        return;
    }
    if cost == 0 {
        eprintln!("benchmark error: cost must be > 0");
        return;
    }

    let result = benchmark_once(producers, tasks_per_producer, cost, unit_us, validate);
    println!("{CSV_HEADER}");
    print_result_row(&result, validate);
}

/// Sweep multiple benchmark configurations and print CSV output.
pub fn run_stress(
    producer_sets: Option<Vec<usize>>,
    task_sets: Option<Vec<usize>>,
    cost_sets: Option<Vec<u32>>,
    unit_us: Option<u64>,
    validate: bool,
) {
    let default_producer_sets = [1usize, 2, 4, 8];
    let default_task_sets = [10usize, 25, 50];
    let default_cost_sets = [1u32, 2, 4];
    let unit_us = unit_us.unwrap_or(100);

    let producer_sets = producer_sets.unwrap_or_else(|| default_producer_sets.to_vec());
    let task_sets = task_sets.unwrap_or_else(|| default_task_sets.to_vec());
    let cost_sets = cost_sets.unwrap_or_else(|| default_cost_sets.to_vec());
    if producer_sets.iter().any(|&producers| producers == 0) {
        eprintln!("stress error: producer_sets must be > 0");
        return;
    }
    if task_sets.iter().any(|&tasks| tasks == 0) {
        eprintln!("stress error: task_sets must be > 0");
        return;
    }
    if cost_sets.iter().any(|&cost| cost == 0) {
        eprintln!("stress error: cost_sets must be > 0");
        return;
    }

    println!("{CSV_HEADER}");
    for producers in producer_sets {
        for tasks_per_producer in task_sets.iter().copied() {
            for cost in cost_sets.iter().copied() {
                let result =
                    benchmark_once(producers, tasks_per_producer, cost, unit_us, validate);
                print_result_row(&result, validate);
            }
        }
    }
}

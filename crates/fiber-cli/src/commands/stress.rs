//! `fiber stress`: run an interleaved workload and check the dispatch invariants.

use anyhow::bail;
use fiber::{Fiber, JobError, JobHandle, Mode, SchedulerStats};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct StressArgs {
    pub exclusive: usize,
    pub concurrent: usize,
    pub workers: Option<usize>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// Outcome of one stress run
#[derive(Debug, Serialize)]
pub struct StressReport {
    pub elapsed_ms: u64,
    pub overlap_violations: usize,
    pub order_violations: usize,
    pub failed_jobs: usize,
    pub stats: SchedulerStats,
}

impl StressReport {
    pub fn is_clean(&self) -> bool {
        self.overlap_violations == 0 && self.order_violations == 0 && self.failed_jobs == 0
    }
}

/// Occupancy counters observed from inside the jobs
#[derive(Default)]
struct Probe {
    exclusive: AtomicUsize,
    concurrent: AtomicUsize,
    violations: AtomicUsize,
    writes: Mutex<Vec<usize>>,
}

impl Probe {
    fn write(&self, seq: usize) {
        let writers = self.exclusive.fetch_add(1, Ordering::SeqCst) + 1;
        if writers > 1 || self.concurrent.load(Ordering::SeqCst) > 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.writes.lock().push(seq);
        self.exclusive.fetch_sub(1, Ordering::SeqCst);
    }

    fn read(&self) {
        self.concurrent.fetch_add(1, Ordering::SeqCst);
        if self.exclusive.load(Ordering::SeqCst) > 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        std::hint::spin_loop();
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of exclusive writes that landed out of submission order
    fn order_violations(&self) -> usize {
        self.writes
            .lock()
            .windows(2)
            .filter(|pair| pair[0] > pair[1])
            .count()
    }
}

pub fn execute(args: StressArgs) -> anyhow::Result<()> {
    let mut config = super::load_config(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }

    let fiber = Fiber::with_config(config)?;
    let report = run(&fiber, args.exclusive, args.concurrent);
    fiber.shutdown();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_clean() {
        bail!(
            "invariant check failed: {} overlap, {} order, {} failed jobs",
            report.overlap_violations,
            report.order_violations,
            report.failed_jobs
        );
    }
    Ok(())
}

/// Submit `exclusive` writers and `concurrent` readers in random order
pub fn run(fiber: &Fiber, exclusive: usize, concurrent: usize) -> StressReport {
    let probe = Arc::new(Probe::default());
    let mut rng = rand::thread_rng();
    let mut handles: Vec<JobHandle<()>> = Vec::with_capacity(exclusive + concurrent);

    info!(exclusive, concurrent, "starting stress run");
    let start = Instant::now();

    let (mut writers_left, mut readers_left) = (exclusive, concurrent);
    let mut seq = 0;
    while writers_left + readers_left > 0 {
        let probe = probe.clone();
        let pick_writer = rng.gen_range(0..writers_left + readers_left) < writers_left;
        let handle = if pick_writer {
            writers_left -= 1;
            let n = seq;
            seq += 1;
            fiber.enqueue(Mode::Exclusive, move || probe.write(n))
        } else {
            readers_left -= 1;
            fiber.enqueue(Mode::Concurrent, move || probe.read())
        };
        handles.push(handle);
    }

    let mut failed_jobs = 0;
    for handle in handles {
        let id = handle.id();
        if let Err(err) = handle.wait() {
            debug!(job = %id, %err, "job failed");
            failed_jobs += 1;
            if err == JobError::PoolUnavailable {
                break;
            }
        }
    }
    fiber.wait_idle(Duration::from_secs(30));

    StressReport {
        elapsed_ms: start.elapsed().as_millis() as u64,
        overlap_violations: probe.violations.load(Ordering::SeqCst),
        order_violations: probe.order_violations(),
        failed_jobs,
        stats: fiber.stats(),
    }
}

fn print_report(report: &StressReport) {
    let stats = &report.stats;
    println!("Elapsed:            {} ms", report.elapsed_ms);
    println!("Submitted:          {}", stats.submitted);
    println!("Completed:          {}", stats.completed);
    println!("Faulted:            {}", stats.faulted);
    println!("Rejected:           {}", stats.rejected);
    println!("Exclusive runs:     {}", stats.exclusive_dispatched);
    println!("Concurrent batches: {}", stats.concurrent_batches);
    println!("Largest batch:      {}", stats.largest_batch);
    println!();
    println!("Overlap violations: {}", report.overlap_violations);
    println!("Order violations:   {}", report.order_violations);
    println!("Failed jobs:        {}", report.failed_jobs);
}

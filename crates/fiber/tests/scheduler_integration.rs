//! Integration tests for the scheduler running on a real worker pool

use fiber::{Job, JobError, JobState, Mode, Scheduler, ThreadPool, WorkerPool};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn create_scheduler(workers: usize) -> (Scheduler, Arc<ThreadPool>) {
    let pool = Arc::new(
        ThreadPool::new(workers, "sched-test", Duration::from_secs(2))
            .expect("Failed to create pool"),
    );
    (Scheduler::new(pool.clone()), pool)
}

/// Shared occupancy counters checked from inside every job
#[derive(Default)]
struct Occupancy {
    exclusive: AtomicUsize,
    concurrent: AtomicUsize,
    violated: AtomicBool,
}

impl Occupancy {
    fn enter(&self, mode: Mode) {
        match mode {
            Mode::Exclusive => {
                let writers = self.exclusive.fetch_add(1, Ordering::SeqCst) + 1;
                if writers > 1 || self.concurrent.load(Ordering::SeqCst) > 0 {
                    self.violated.store(true, Ordering::SeqCst);
                }
            }
            Mode::Concurrent => {
                self.concurrent.fetch_add(1, Ordering::SeqCst);
                if self.exclusive.load(Ordering::SeqCst) > 0 {
                    self.violated.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn leave(&self, mode: Mode) {
        match mode {
            Mode::Exclusive => self.exclusive.fetch_sub(1, Ordering::SeqCst),
            Mode::Concurrent => self.concurrent.fetch_sub(1, Ordering::SeqCst),
        };
    }
}

#[test]
fn test_mutual_exclusion_random_interleaving() {
    let (scheduler, _pool) = create_scheduler(8);
    let occupancy = Arc::new(Occupancy::default());
    let mut rng = rand::thread_rng();

    let mut handles = Vec::new();
    for _ in 0..2000 {
        let mode = if rng.gen_bool(0.2) {
            Mode::Exclusive
        } else {
            Mode::Concurrent
        };
        let spin = rng.gen_range(0..50u64);
        let occupancy = occupancy.clone();

        let (job, handle) = Job::new(mode, move || {
            occupancy.enter(mode);
            thread::sleep(Duration::from_micros(spin));
            occupancy.leave(mode);
        });
        scheduler.submit(job).unwrap();
        handles.push(handle);
    }

    for handle in handles {
        handle.wait().unwrap();
    }

    assert!(!occupancy.violated.load(Ordering::SeqCst));
    let stats = scheduler.stats();
    assert_eq!(stats.submitted, 2000);
    assert_eq!(stats.completed, 2000);
    assert!(stats.largest_batch >= 1);
}

#[test]
fn test_concurrent_submitters() {
    let (scheduler, _pool) = create_scheduler(4);
    let occupancy = Arc::new(Occupancy::default());
    let total = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let scheduler = scheduler.clone();
            let occupancy = occupancy.clone();
            let total = total.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    let mode = if (t + i) % 5 == 0 {
                        Mode::Exclusive
                    } else {
                        Mode::Concurrent
                    };
                    let occupancy = occupancy.clone();
                    let total = total.clone();
                    let (job, _handle) = Job::new(mode, move || {
                        occupancy.enter(mode);
                        total.fetch_add(1, Ordering::SeqCst);
                        occupancy.leave(mode);
                    });
                    scheduler.submit(job).unwrap();
                }
            })
        })
        .collect();

    for submitter in submitters {
        submitter.join().unwrap();
    }

    assert!(scheduler.wait_idle(Duration::from_secs(10)));
    assert_eq!(total.load(Ordering::SeqCst), 1000);
    assert!(!occupancy.violated.load(Ordering::SeqCst));
    assert_eq!(scheduler.running(), (0, 0));
    assert_eq!(scheduler.queued(), (0, 0));
}

#[test]
fn test_results_are_delivered() {
    let (scheduler, _pool) = create_scheduler(4);
    let expected: u64 = rand::thread_rng().gen();

    let (job, handle) = Job::new(Mode::Concurrent, move || expected);
    let id = scheduler.submit(job).unwrap();

    assert_eq!(handle.id(), id);
    assert_eq!(handle.wait(), Ok(expected));
}

#[test]
fn test_stop_keeps_queued_work() {
    let (scheduler, _pool) = create_scheduler(2);
    let ran = Arc::new(AtomicUsize::new(0));

    let blocker_ran = ran.clone();
    let (blocker, blocker_handle) = Job::new(Mode::Exclusive, move || {
        thread::sleep(Duration::from_millis(100));
        blocker_ran.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.submit(blocker).unwrap();

    let queued_ran = ran.clone();
    let (queued, queued_handle) = Job::new(Mode::Concurrent, move || {
        queued_ran.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.submit(queued).unwrap();
    assert_eq!(queued_handle.state(), JobState::Queued);

    scheduler.stop();

    let (late, late_handle) = Job::new(Mode::Concurrent, || ());
    assert!(scheduler.submit(late).is_err());
    assert_eq!(late_handle.state(), JobState::Rejected);
    assert_eq!(late_handle.wait(), Err(JobError::SchedulerStopped));

    assert_eq!(blocker_handle.wait(), Ok(()));
    assert_eq!(queued_handle.wait(), Ok(()));
    assert_eq!(ran.load(Ordering::SeqCst), 2);

    let stats = scheduler.stats();
    assert!(stats.stopped);
    assert_eq!(stats.rejected, 1);
}

#[test]
fn test_panicking_jobs_do_not_stall_queue() {
    let (scheduler, _pool) = create_scheduler(2);

    let mut handles = Vec::new();
    for i in 0..20 {
        let (job, handle) = Job::new(Mode::Exclusive, move || {
            if i % 4 == 0 {
                panic!("job {} failed", i);
            }
            i
        });
        scheduler.submit(job).unwrap();
        handles.push(handle);
    }

    for (i, handle) in handles.into_iter().enumerate() {
        match handle.wait() {
            Ok(value) => assert_eq!(value, i),
            Err(err) => {
                assert_eq!(i % 4, 0);
                assert_eq!(err, JobError::Panicked(format!("job {} failed", i)));
            }
        }
    }

    let stats = scheduler.stats();
    assert_eq!(stats.faulted, 5);
    assert_eq!(stats.completed, 15);
}

#[test]
fn test_pool_shutdown_stops_scheduler() {
    let (scheduler, pool) = create_scheduler(2);
    pool.shutdown();

    let (job, handle) = Job::new(Mode::Exclusive, || 1);
    assert!(scheduler.submit(job).is_err());
    assert_eq!(handle.wait(), Err(JobError::PoolUnavailable));
    assert!(scheduler.is_stopped());
}

//! Dual-mode scheduler arbitrating between exclusive and concurrent work

use crate::error::{FiberError, FiberResult, JobError};
use crate::scheduler::{Job, JobId, JobState, Mode, WorkerPool};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Jobs accepted into a queue
    pub submitted: u64,

    /// Jobs that finished with a value
    pub completed: u64,

    /// Jobs that finished with a captured failure
    pub faulted: u64,

    /// Jobs refused or drained without running
    pub rejected: u64,

    /// Exclusive jobs handed to the pool
    pub exclusive_dispatched: u64,

    /// Concurrent batches handed to the pool
    pub concurrent_batches: u64,

    /// Size of the largest concurrent batch so far
    pub largest_batch: usize,

    /// Exclusive jobs currently running (0 or 1)
    pub running_exclusive: usize,

    /// Concurrent jobs currently running
    pub running_concurrent: usize,

    /// Exclusive jobs waiting
    pub queued_exclusive: usize,

    /// Concurrent jobs waiting
    pub queued_concurrent: usize,

    /// Whether submissions are refused
    pub stopped: bool,
}

/// Queues, running counters and the stop flag. Only touched under the lock.
#[derive(Default)]
struct SchedulerState {
    exclusive_queue: VecDeque<Job>,
    concurrent_queue: VecDeque<Job>,
    running_exclusive: usize,
    running_concurrent: usize,
    /// Jobs whose counters were released but whose result is still being published
    settling: usize,
    stopped: bool,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn is_idle(&self) -> bool {
        self.exclusive_queue.is_empty()
            && self.concurrent_queue.is_empty()
            && self.running_exclusive == 0
            && self.running_concurrent == 0
            && self.settling == 0
    }

    fn release(&mut self, mode: Mode) {
        match mode {
            Mode::Exclusive => self.running_exclusive -= 1,
            Mode::Concurrent => self.running_concurrent -= 1,
        }
    }
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    /// Signalled whenever the scheduler becomes idle
    idle: Condvar,
    pool: Arc<dyn WorkerPool>,
}

/// Dual-mode scheduler
///
/// Exclusive jobs run alone; concurrent jobs run in parallel with each other
/// but never alongside an exclusive job. Cloning yields another handle to the
/// same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Create a scheduler that hands ready jobs to `pool`
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState::default()),
                idle: Condvar::new(),
                pool,
            }),
        }
    }

    /// Queue a job and run a dispatch pass
    ///
    /// Fails with [`FiberError::SchedulerStopped`] after [`stop`](Self::stop);
    /// the job's handle then resolves to [`JobError::SchedulerStopped`]. Fails
    /// with [`FiberError::PoolUnavailable`] if the pool refused the hand-off,
    /// which also stops the scheduler.
    pub fn submit(&self, job: Job) -> FiberResult<JobId> {
        let id = job.id();
        let mode = job.mode();

        let mut state = self.shared.state.lock();
        if state.stopped {
            state.stats.rejected += 1;
            drop(state);
            debug!(job = %id, %mode, "submission after stop rejected");
            job.reject(JobError::SchedulerStopped);
            return Err(FiberError::SchedulerStopped);
        }

        job.mark(JobState::Queued);
        match mode {
            Mode::Exclusive => state.exclusive_queue.push_back(job),
            Mode::Concurrent => state.concurrent_queue.push_back(job),
        }
        state.stats.submitted += 1;
        trace!(job = %id, %mode, "job queued");

        let refused = self.dispatch(&mut state);
        drop(state);

        if refused.is_empty() {
            Ok(id)
        } else {
            Self::reject_all(refused, JobError::PoolUnavailable);
            Err(FiberError::PoolUnavailable)
        }
    }

    /// Refuse further submissions. Queued and running jobs still complete.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if !state.stopped {
            state.stopped = true;
            state.stats.stopped = true;
            info!(
                queued = state.exclusive_queue.len() + state.concurrent_queue.len(),
                "scheduler stopped"
            );
        }
    }

    /// Count a job the caller rejected before it reached a queue
    pub(crate) fn record_rejected(&self) {
        self.shared.state.lock().stats.rejected += 1;
    }

    /// Whether submissions are refused
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Currently running jobs as `(exclusive, concurrent)`
    pub fn running(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.running_exclusive, state.running_concurrent)
    }

    /// Currently queued jobs as `(exclusive, concurrent)`
    pub fn queued(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.exclusive_queue.len(), state.concurrent_queue.len())
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock();
        SchedulerStats {
            running_exclusive: state.running_exclusive,
            running_concurrent: state.running_concurrent,
            queued_exclusive: state.exclusive_queue.len(),
            queued_concurrent: state.concurrent_queue.len(),
            ..state.stats.clone()
        }
    }

    /// Block until both queues are empty and no job is running, or `timeout`
    /// elapses. Returns whether the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            if self
                .shared
                .idle
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.is_idle();
            }
        }
        true
    }

    /// Called on the worker thread once a dispatched job has run
    fn on_completion(&self, job: Job, ok: bool) {
        let id = job.id();
        let mode = job.mode();

        {
            let mut state = self.shared.state.lock();
            state.release(mode);
            state.settling += 1;
            if ok {
                state.stats.completed += 1;
            } else {
                state.stats.faulted += 1;
            }
        }

        // Result slot and completion signal, outside the lock
        job.settle();
        trace!(job = %id, %mode, ok, "job finished");

        let refused = {
            let mut state = self.shared.state.lock();
            state.settling -= 1;
            let refused = self.dispatch(&mut state);
            if state.is_idle() {
                self.shared.idle.notify_all();
            }
            refused
        };
        Self::reject_all(refused, JobError::PoolUnavailable);
    }

    /// Apply the dispatch rule until no progress can be made
    ///
    /// 1. Nothing running and an exclusive job waiting: start that one job.
    /// 2. No exclusive job running or waiting: start every queued concurrent
    ///    job as one batch.
    /// 3. Otherwise wait for a completion.
    ///
    /// Hand-off happens under the lock so the pool sees jobs in dequeue order.
    /// Returns the jobs that must be rejected because the pool went away.
    #[must_use]
    fn dispatch(&self, state: &mut MutexGuard<'_, SchedulerState>) -> Vec<Job> {
        let mut refused = Vec::new();

        loop {
            if state.running_exclusive == 0 && state.running_concurrent == 0 {
                if let Some(job) = state.exclusive_queue.pop_front() {
                    state.running_exclusive += 1;
                    state.stats.exclusive_dispatched += 1;
                    if let Err(job) = self.hand_off(job) {
                        state.release(Mode::Exclusive);
                        refused.push(job);
                        break;
                    }
                    continue;
                }
            }

            if state.running_exclusive == 0
                && state.exclusive_queue.is_empty()
                && !state.concurrent_queue.is_empty()
            {
                let batch: Vec<Job> = state.concurrent_queue.drain(..).collect();
                state.running_concurrent += batch.len();
                state.stats.concurrent_batches += 1;
                state.stats.largest_batch = state.stats.largest_batch.max(batch.len());
                debug!(size = batch.len(), "dispatching concurrent batch");

                let mut jobs = batch.into_iter();
                while let Some(job) = jobs.next() {
                    if let Err(job) = self.hand_off(job) {
                        state.release(Mode::Concurrent);
                        refused.push(job);
                        for rest in jobs.by_ref() {
                            state.release(Mode::Concurrent);
                            refused.push(rest);
                        }
                    }
                }
                if !refused.is_empty() {
                    break;
                }
                continue;
            }

            break;
        }

        debug_assert!(state.running_exclusive <= 1);
        debug_assert!(state.running_exclusive == 0 || state.running_concurrent == 0);

        if !refused.is_empty() {
            // The pool is gone: behave as if stopped and give up on queued work
            state.stopped = true;
            state.stats.stopped = true;
            refused.extend(state.exclusive_queue.drain(..));
            refused.extend(state.concurrent_queue.drain(..));
            state.stats.rejected += refused.len() as u64;
            warn!(rejected = refused.len(), "worker pool refused hand-off, scheduler stopped");
            if state.is_idle() {
                self.shared.idle.notify_all();
            }
        }

        refused
    }

    /// Give a job to the pool. Returns it back if the pool refused it.
    fn hand_off(&self, job: Job) -> Result<(), Job> {
        job.mark(JobState::Running);
        trace!(job = %job.id(), mode = %job.mode(), "handing job to pool");
        let task = Dispatch {
            id: job.id(),
            mode: job.mode(),
            job: Some(job),
            scheduler: self.clone(),
        };
        match self.shared.pool.execute(task) {
            Ok(()) => Ok(()),
            Err(mut task) => task.job.take().map_or(Ok(()), Err),
        }
    }

    fn reject_all(jobs: Vec<Job>, err: JobError) {
        for job in jobs {
            job.reject(err.clone());
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A job handed to a [`WorkerPool`], bundled with the scheduler that must
/// hear about its completion
///
/// Running it executes the callable and reports back to the scheduler. A
/// dispatch that is dropped without running is reported as abandoned so its
/// slot is released.
pub struct Dispatch {
    id: JobId,
    mode: Mode,
    job: Option<Job>,
    scheduler: Scheduler,
}

impl Dispatch {
    /// ID of the dispatched job
    pub fn job_id(&self) -> JobId {
        self.id
    }

    /// Mode of the dispatched job
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Execute the job on the current thread and report completion
    pub fn run(mut self) {
        if let Some(mut job) = self.job.take() {
            let ok = job.run();
            if !ok {
                warn!(job = %job.id(), mode = %job.mode(), "job failed");
            }
            self.scheduler.on_completion(job, ok);
        }
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            warn!(job = %job.id(), "dispatched job dropped without running");
            self.scheduler.on_completion(job, false);
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

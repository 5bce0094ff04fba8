//! Job structure, result slot and completion signal

use crate::error::JobError;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Execution mode of a job
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Runs with no other job executing
    Exclusive,
    /// Runs alongside other concurrent jobs, never alongside an exclusive one
    Concurrent,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Exclusive => f.write_str("exclusive"),
            Mode::Concurrent => f.write_str("concurrent"),
        }
    }
}

/// Unique identifier for a Job
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

impl JobId {
    /// Generate a new unique JobId
    pub fn new() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a Job
///
/// Accepted jobs move `Queued → Running → Completed | Faulted`. `Delayed`
/// precedes `Queued` for deferred submissions, and `Rejected` is reached only
/// by jobs the scheduler refused (or drained after the pool went away).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its submission delay to elapse
    Delayed,
    /// Sitting in a scheduler queue
    Queued,
    /// Handed to the worker pool
    Running,
    /// Finished with a value
    Completed,
    /// Finished with a captured failure
    Faulted,
    /// Never ran: refused by the scheduler
    Rejected,
}

impl JobState {
    /// Whether the job has reached a final state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Faulted | JobState::Rejected
        )
    }
}

/// Result slot plus the parties waiting on it
struct Slot<T> {
    state: JobState,
    outcome: Option<Result<T, JobError>>,
    waker: Option<Waker>,
}

/// Single-assignment result slot shared by a job and its handle
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new(state: JobState) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                state,
                outcome: None,
                waker: None,
            }),
            condvar: Condvar::new(),
        })
    }

    fn state(&self) -> JobState {
        self.slot.lock().state
    }

    fn set_state(&self, state: JobState) {
        let mut slot = self.slot.lock();
        if !slot.state.is_terminal() {
            slot.state = state;
        }
    }

    /// Write the outcome and fire the completion signal. Later writes are ignored.
    pub(crate) fn fulfil(&self, outcome: Result<T, JobError>, state: JobState) {
        let waker = {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return;
            }
            slot.outcome = Some(outcome);
            slot.state = state;
            self.condvar.notify_all();
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Type-erased body of a job, as seen by the scheduler
trait Work: Send {
    fn mark(&self, state: JobState);
    fn run(&mut self) -> bool;
    fn settle(self: Box<Self>);
    fn reject(self: Box<Self>, err: JobError);
}

struct Runnable<T, F> {
    callable: Option<F>,
    outcome: Option<Result<T, JobError>>,
    completion: Arc<Completion<T>>,
}

impl<T, F> Work for Runnable<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
{
    fn mark(&self, state: JobState) {
        self.completion.set_state(state);
    }

    fn run(&mut self) -> bool {
        let Some(callable) = self.callable.take() else {
            return false;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(callable))
            .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload))));
        let ok = outcome.is_ok();
        self.outcome = Some(outcome);
        ok
    }

    fn settle(mut self: Box<Self>) {
        match self.outcome.take() {
            Some(Ok(value)) => self.completion.fulfil(Ok(value), JobState::Completed),
            Some(Err(err)) => self.completion.fulfil(Err(err), JobState::Faulted),
            None => self
                .completion
                .fulfil(Err(JobError::Abandoned), JobState::Faulted),
        }
    }

    fn reject(self: Box<Self>, err: JobError) {
        self.completion.fulfil(Err(err), JobState::Rejected);
    }
}

// A job dropped before it was settled or rejected still resolves its handle
impl<T, F> Drop for Runnable<T, F> {
    fn drop(&mut self) {
        self.completion
            .fulfil(Err(JobError::Abandoned), JobState::Faulted);
    }
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A unit of submitted work
///
/// Owns the callable until it runs. The typed result is delivered through the
/// [`JobHandle`] returned alongside it by [`Job::new`].
pub struct Job {
    id: JobId,
    mode: Mode,
    work: Box<dyn Work>,
}

impl Job {
    /// Create a job and the handle that observes its result
    pub fn new<T, F>(mode: Mode, callable: F) -> (Job, JobHandle<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = JobHandle::pending(mode, JobState::Queued);
        let job = Job::for_handle(&handle, move || Ok(callable()));
        (job, handle)
    }

    /// Create the job that will fulfil an existing handle. The callable may
    /// report its own failure.
    pub(crate) fn for_handle<T, F>(handle: &JobHandle<T>, callable: F) -> Job
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        Job {
            id: handle.id,
            mode: handle.mode,
            work: Box::new(Runnable {
                callable: Some(callable),
                outcome: None,
                completion: handle.completion.clone(),
            }),
        }
    }

    /// Get the job's unique ID
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Get the job's execution mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn mark(&self, state: JobState) {
        self.work.mark(state);
    }

    /// Run the callable on the current thread, capturing a panic as failure.
    /// Returns whether the callable produced a value.
    pub(crate) fn run(&mut self) -> bool {
        self.work.run()
    }

    /// Publish the captured outcome to the handle
    pub(crate) fn settle(self) {
        self.work.settle();
    }

    /// Resolve the handle with an error without running the callable
    pub(crate) fn reject(self, err: JobError) {
        self.work.reject(err);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Caller-side handle to a job's eventual result
///
/// Block on it with [`wait`](JobHandle::wait) or `.await` it from async code.
/// Dropping the handle does not cancel the job.
pub struct JobHandle<T> {
    id: JobId,
    mode: Mode,
    completion: Arc<Completion<T>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn pending(mode: Mode, state: JobState) -> Self {
        Self {
            id: JobId::new(),
            mode,
            completion: Completion::new(state),
        }
    }

    /// A handle that is already resolved with `err`
    pub(crate) fn rejected(mode: Mode, err: JobError) -> Self {
        let handle = Self::pending(mode, JobState::Queued);
        handle.completion.fulfil(Err(err), JobState::Rejected);
        handle
    }

    /// Get the job's unique ID
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Get the job's execution mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Get the current state
    pub fn state(&self) -> JobState {
        self.completion.state()
    }

    /// Whether the result is available
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until the job finishes and return its result
    pub fn wait(self) -> Result<T, JobError> {
        let mut slot = self.completion.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome.take() {
                return outcome;
            }
            self.completion.condvar.wait(&mut slot);
        }
    }

    /// Block until the job finishes or `timeout` elapses.
    /// Returns whether the job finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.completion.slot.lock();
        while !slot.state.is_terminal() {
            if self
                .completion
                .condvar
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return slot.state.is_terminal();
            }
        }
        true
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.completion.slot.lock();
        if let Some(outcome) = slot.outcome.take() {
            return Poll::Ready(outcome);
        }
        match slot.waker {
            Some(ref waker) if waker.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}

//! Job scheduler for exclusive/concurrent dispatch
//!
//! The scheduler owns two FIFO queues and decides which jobs may run. A worker
//! pool executes them and a timer thread defers submissions.

mod job;
mod pool;
#[allow(clippy::module_inception)]
mod scheduler;
mod timer;

pub use job::{Job, JobHandle, JobId, JobState, Mode};
pub(crate) use job::panic_message;
pub use pool::{ThreadPool, WorkerPool};
pub use scheduler::{Dispatch, Scheduler, SchedulerStats};
pub use timer::{Timer, TimerAction, TimerThread};

//! Fiber: exclusive/concurrent job dispatch
//!
//! This crate provides a reader/writer lock expressed as a dispatch engine:
//! - Exclusive jobs run with nothing else executing
//! - Concurrent jobs run in parallel with each other, never with exclusive ones
//! - Suspending jobs (futures) hold their slot until they fully complete
//! - Deferred submission through a timer thread
//!
//! ```ignore
//! let fiber = Fiber::new()?;
//! let read = fiber.enqueue(Mode::Concurrent, || cache.len());
//! let write = fiber.enqueue(Mode::Exclusive, move || cache.clear());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod bridge;
pub mod config;
pub mod error;
mod fiber;
pub mod scheduler;

pub use config::FiberConfig;
pub use error::{ConfigError, FiberError, FiberResult, JobError};
pub use fiber::{Fiber, FiberBuilder};
pub use scheduler::{
    Dispatch, Job, JobHandle, JobId, JobState, Mode, Scheduler, SchedulerStats, ThreadPool,
    Timer, TimerAction, TimerThread, WorkerPool,
};

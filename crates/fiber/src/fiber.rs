//! Fiber: public entry point
//!
//! Combines job creation, scheduler submission, the async bridge and the
//! timer into four submission families. Every submission names its mode
//! explicitly and returns a [`JobHandle`] for the eventual result.

use crate::bridge::{self, AsyncContext};
use crate::config::FiberConfig;
use crate::error::{FiberResult, JobError};
use crate::scheduler::{
    Job, JobHandle, JobState, Mode, Scheduler, SchedulerStats, ThreadPool, Timer, TimerThread,
    WorkerPool,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Exclusive/concurrent job dispatcher over a shared worker pool
///
/// Submissions after [`stop`](Fiber::stop) return handles that are already
/// resolved to [`JobError::SchedulerStopped`].
pub struct Fiber {
    scheduler: Scheduler,
    pool: Arc<dyn WorkerPool>,
    timer: Arc<dyn Timer>,
    context: Option<AsyncContext>,
    runtime: Handle,
    config: FiberConfig,
}

impl Fiber {
    /// Create a fiber with the default configuration
    pub fn new() -> FiberResult<Self> {
        FiberBuilder::new().build()
    }

    /// Create a fiber from a configuration
    pub fn with_config(config: FiberConfig) -> FiberResult<Self> {
        FiberBuilder::new().config(config).build()
    }

    /// Start building a fiber with custom collaborators
    pub fn builder() -> FiberBuilder {
        FiberBuilder::new()
    }

    /// Submit a callable for immediate execution
    pub fn enqueue<T, F>(&self, mode: Mode, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(mode, move || Ok(f()))
    }

    /// Submit a suspending callable for immediate execution
    ///
    /// The job holds its slot until the future has fully completed.
    pub fn enqueue_async<T, F, Fut>(&self, mode: Mode, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.submit(mode, bridge::wrap(self.runtime.clone(), f))
    }

    /// Submit a callable once `delay` has elapsed
    ///
    /// The handle resolves after the delay *and* the job has run.
    pub fn schedule<T, F>(&self, mode: Mode, delay: Duration, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.defer(mode, delay, move || Ok(f()))
    }

    /// Submit a suspending callable once `delay` has elapsed
    pub fn schedule_async<T, F, Fut>(&self, mode: Mode, delay: Duration, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.defer(mode, delay, bridge::wrap(self.runtime.clone(), f))
    }

    /// Refuse further submissions. Queued and running jobs still complete.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Whether submissions are refused
    pub fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }

    /// Block until no job is queued or running, or `timeout` elapses.
    /// Returns whether the fiber went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Get the underlying scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Get the configuration this fiber was built with
    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    /// Stop, wait for queued work up to the configured timeout, then release
    /// all threads. Returns whether every job finished in time.
    pub fn shutdown(self) -> bool {
        self.stop();
        let drained = self.wait_idle(self.config.shutdown_timeout());
        info!(drained, "fiber shutting down");
        drained
    }

    fn submit<T, F>(&self, mode: Mode, callable: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        if self.scheduler.is_stopped() {
            self.scheduler.record_rejected();
            return JobHandle::rejected(mode, JobError::SchedulerStopped);
        }
        let handle = JobHandle::pending(mode, JobState::Queued);
        let job = Job::for_handle(&handle, callable);
        // A refused job has already resolved its handle
        let _ = self.scheduler.submit(job);
        handle
    }

    fn defer<T, F>(&self, mode: Mode, delay: Duration, callable: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, JobError> + Send + 'static,
    {
        if delay.is_zero() {
            return self.submit(mode, callable);
        }
        if self.scheduler.is_stopped() {
            self.scheduler.record_rejected();
            return JobHandle::rejected(mode, JobError::SchedulerStopped);
        }

        let handle = JobHandle::pending(mode, JobState::Delayed);
        let deferred = DeferredSubmit {
            job: Some(Job::for_handle(&handle, callable)),
            scheduler: self.scheduler.clone(),
        };
        debug!(job = %handle.id(), %mode, ?delay, "job deferred");

        // A refused action is dropped here, which rejects its job
        let _ = self.timer.after(delay, Box::new(move || deferred.fire()));
        handle
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.timer.shutdown();
        self.pool.shutdown();
        if let Some(context) = self.context.take() {
            context.shutdown();
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("scheduler", &self.scheduler)
            .field("context", &self.context)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A job waiting on the timer. Rejects its job if dropped before firing.
struct DeferredSubmit {
    job: Option<Job>,
    scheduler: Scheduler,
}

impl DeferredSubmit {
    fn fire(mut self) {
        if let Some(job) = self.job.take() {
            // Rejection after stop resolves the handle inside submit
            let _ = self.scheduler.submit(job);
        }
    }
}

impl Drop for DeferredSubmit {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            debug!(job = %job.id(), "deferred job dropped before firing");
            self.scheduler.record_rejected();
            job.reject(JobError::SchedulerStopped);
        }
    }
}

/// Builder for a [`Fiber`] with custom collaborators
#[derive(Default)]
pub struct FiberBuilder {
    config: FiberConfig,
    pool: Option<Arc<dyn WorkerPool>>,
    timer: Option<Arc<dyn Timer>>,
    runtime: Option<Handle>,
}

impl FiberBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` for thread counts, names and timeouts
    pub fn config(mut self, config: FiberConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute jobs on `pool` instead of a private [`ThreadPool`]
    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Defer submissions with `timer` instead of a private [`TimerThread`]
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Run suspending jobs on an existing tokio runtime
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the fiber, spawning whatever collaborators were not supplied
    pub fn build(self) -> FiberResult<Fiber> {
        let FiberBuilder {
            config,
            pool,
            timer,
            runtime,
        } = self;
        config.validate()?;

        let pool: Arc<dyn WorkerPool> = match pool {
            Some(pool) => pool,
            None => Arc::new(ThreadPool::new(
                config.worker_count(),
                &config.thread_name,
                config.shutdown_timeout(),
            )?),
        };

        let timer: Arc<dyn Timer> = match timer {
            Some(timer) => timer,
            None => {
                let timer = TimerThread::new(config.shutdown_timeout());
                timer.start(&config.thread_name)?;
                timer
            }
        };

        let context = match runtime {
            Some(handle) => AsyncContext::Borrowed(handle),
            None => AsyncContext::owned(config.async_worker_count(), &config.thread_name)?,
        };
        let runtime = context.handle();

        info!(
            workers = config.worker_count(),
            thread_name = %config.thread_name,
            "fiber started"
        );

        Ok(Fiber {
            scheduler: Scheduler::new(pool.clone()),
            pool,
            timer,
            context: Some(context),
            runtime,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fiber() -> Fiber {
        Fiber::with_config(FiberConfig {
            worker_threads: 4,
            async_threads: 2,
            ..FiberConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_enqueue_returns_value() {
        let fiber = fiber();
        let handle = fiber.enqueue(Mode::Exclusive, || 6 * 7);
        assert_eq!(handle.mode(), Mode::Exclusive);
        assert_eq!(handle.wait(), Ok(42));
    }

    #[test]
    fn test_enqueue_async_returns_value() {
        let fiber = fiber();
        let handle = fiber.enqueue_async(Mode::Concurrent, || async {
            tokio::task::yield_now().await;
            "async"
        });
        assert_eq!(handle.wait(), Ok("async"));
    }

    #[test]
    fn test_schedule_starts_delayed() {
        let fiber = fiber();
        let start = Instant::now();
        let handle = fiber.schedule(Mode::Exclusive, Duration::from_millis(100), || 1);
        assert_eq!(handle.state(), JobState::Delayed);
        assert_eq!(handle.wait(), Ok(1));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_schedule_zero_delay_is_immediate() {
        let fiber = fiber();
        let handle = fiber.schedule(Mode::Concurrent, Duration::ZERO, || 2);
        assert_ne!(handle.state(), JobState::Delayed);
        assert_eq!(handle.wait(), Ok(2));
    }

    #[test]
    fn test_stop_rejects_new_work() {
        let fiber = fiber();
        fiber.stop();
        assert!(fiber.is_stopped());

        let now = fiber.enqueue(Mode::Exclusive, || 1);
        let later = fiber.schedule(Mode::Concurrent, Duration::from_millis(10), || 2);
        let suspending = fiber.enqueue_async(Mode::Concurrent, || async { 3 });

        assert_eq!(now.wait(), Err(JobError::SchedulerStopped));
        assert_eq!(later.wait(), Err(JobError::SchedulerStopped));
        assert_eq!(suspending.wait(), Err(JobError::SchedulerStopped));

        let stats = fiber.stats();
        assert_eq!(stats.submitted, 0);
        assert_eq!(stats.rejected, 3);
    }

    #[test]
    fn test_stop_during_delay_rejects_job() {
        let fiber = fiber();
        let handle = fiber.schedule(Mode::Exclusive, Duration::from_millis(50), || 1);
        fiber.stop();
        assert_eq!(handle.wait(), Err(JobError::SchedulerStopped));
    }

    #[test]
    fn test_drop_rejects_pending_deferred_jobs() {
        let fiber = fiber();
        let handle = fiber.schedule(Mode::Exclusive, Duration::from_secs(60), || 1);
        drop(fiber);
        assert_eq!(handle.wait(), Err(JobError::SchedulerStopped));
    }

    #[test]
    fn test_timer_drop_counts_rejection() {
        let fiber = fiber();
        let handle = fiber.schedule(Mode::Concurrent, Duration::from_secs(60), || 1);
        fiber.timer.shutdown();

        assert_eq!(handle.wait(), Err(JobError::SchedulerStopped));
        let stats = fiber.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.submitted, 0);
    }

    #[test]
    fn test_stop_during_delay_counts_rejection() {
        let fiber = fiber();
        let handle = fiber.schedule(Mode::Exclusive, Duration::from_millis(30), || 1);
        fiber.stop();

        assert_eq!(handle.wait(), Err(JobError::SchedulerStopped));
        assert_eq!(fiber.stats().rejected, 1);
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let fiber = fiber();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                fiber.enqueue(Mode::Exclusive, move || {
                    std::thread::sleep(Duration::from_millis(5));
                    i
                })
            })
            .collect();

        assert!(fiber.shutdown());
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait(), Ok(i));
        }
    }

    #[test]
    fn test_builder_with_external_runtime() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let fiber = Fiber::builder()
            .config(FiberConfig {
                worker_threads: 2,
                ..FiberConfig::default()
            })
            .runtime(rt.handle().clone())
            .build()
            .unwrap();

        let handle = fiber.enqueue_async(Mode::Exclusive, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            "external"
        });
        assert_eq!(handle.wait(), Ok("external"));
        drop(fiber);

        // The caller's runtime survives the fiber
        assert_eq!(rt.block_on(async { 1 + 1 }), 2);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = Fiber::with_config(FiberConfig {
            thread_name: String::new(),
            ..FiberConfig::default()
        });
        assert!(result.is_err());
    }
}

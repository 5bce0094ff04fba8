//! Async bridge: run a suspending job while holding its slot
//!
//! The scheduler only knows about threads. A future that yields would give its
//! worker thread back at the first `.await` while its slot is still logically
//! held, so the bridge launches the future on a tokio runtime and keeps the
//! worker thread blocked on a one-shot channel until the future is done.

use crate::error::{FiberError, FiberResult, JobError};
use crate::scheduler::panic_message;
use crossbeam::channel;
use std::fmt;
use std::future::Future;
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

/// Where suspending jobs run
pub(crate) enum AsyncContext {
    /// Runtime built and owned by the fiber
    Owned(Runtime),
    /// Runtime supplied by the caller
    Borrowed(Handle),
}

impl AsyncContext {
    /// Build a multi-threaded runtime with `threads` workers named `{name}-async`
    pub(crate) fn owned(threads: usize, name: &str) -> FiberResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(format!("{}-async", name))
            .enable_all()
            .build()
            .map_err(FiberError::Runtime)?;
        debug!(threads, "async runtime started");
        Ok(AsyncContext::Owned(runtime))
    }

    pub(crate) fn handle(&self) -> Handle {
        match self {
            AsyncContext::Owned(runtime) => runtime.handle().clone(),
            AsyncContext::Borrowed(handle) => handle.clone(),
        }
    }

    /// Stop an owned runtime without blocking. Safe inside async contexts.
    pub(crate) fn shutdown(self) {
        if let AsyncContext::Owned(runtime) = self {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncContext::Owned(_) => f.write_str("AsyncContext::Owned"),
            AsyncContext::Borrowed(_) => f.write_str("AsyncContext::Borrowed"),
        }
    }
}

/// Turn a future factory into a blocking callable
///
/// The returned callable must run on a thread that is not a tokio worker: it
/// spawns `make()` on `runtime` and blocks until the future finishes. A panic
/// inside the future becomes [`JobError::Panicked`]; a runtime that goes away
/// first yields [`JobError::Abandoned`].
pub(crate) fn wrap<T, F, Fut>(
    runtime: Handle,
    make: F,
) -> impl FnOnce() -> Result<T, JobError> + Send + 'static
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    move || {
        let (done_tx, done_rx) = channel::bounded(1);

        let task = runtime.spawn(async move { make().await });
        runtime.spawn(async move {
            let _ = done_tx.send(task.await);
        });

        match done_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_panic() => {
                Err(JobError::Panicked(panic_message(err.into_panic())))
            }
            // Cancelled by runtime shutdown, or the forwarding task never ran
            Ok(Err(_)) | Err(_) => Err(JobError::Abandoned),
        }
    }
}

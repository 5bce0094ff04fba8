//! Worker pool that executes dispatched jobs
//!
//! The scheduler decides *when* a job may run; the pool only provides threads.
//! [`ThreadPool`] is the default: a fixed set of named OS threads fed through
//! an unbounded channel, so a hand-off never blocks the dispatching thread.

use crate::error::{FiberError, FiberResult};
use crate::scheduler::Dispatch;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Executes dispatched jobs on some thread
///
/// Implementations must never run the task inline inside `execute`, and must
/// not drop it there either: the scheduler hands off while holding its lock.
pub trait WorkerPool: Send + Sync + 'static {
    /// Queue `task` for execution. Gives the task back if the pool has shut down.
    fn execute(&self, task: Dispatch) -> Result<(), Dispatch>;

    /// Stop accepting work. Already accepted tasks still run.
    fn shutdown(&self) {}
}

/// Fixed-size pool of worker threads
pub struct ThreadPool {
    /// Channel: dispatcher → workers. `None` once shut down.
    task_tx: RwLock<Option<Sender<Dispatch>>>,

    /// Worker thread handles
    handles: Mutex<Vec<JoinHandle<()>>>,

    /// Number of worker threads
    size: usize,

    /// How long shutdown waits for each worker
    join_timeout: Duration,
}

impl ThreadPool {
    /// Spawn `size` workers named `{name}-{i}`. A `size` of 0 uses the CPU count.
    pub fn new(size: usize, name: &str, join_timeout: Duration) -> FiberResult<Self> {
        let size = if size == 0 { num_cpus::get() } else { size };
        let (task_tx, task_rx) = channel::unbounded::<Dispatch>();

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = task_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || Self::worker_loop(rx))
                .map_err(FiberError::ThreadSpawn)?;
            handles.push(handle);
        }
        debug!(size, name, "worker pool started");

        Ok(Self {
            task_tx: RwLock::new(Some(task_tx)),
            handles: Mutex::new(handles),
            size,
            join_timeout,
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the pool still accepts work
    pub fn is_running(&self) -> bool {
        self.task_tx.read().is_some()
    }

    fn worker_loop(task_rx: Receiver<Dispatch>) {
        // Runs until every sender is gone and the channel is drained
        for task in task_rx.iter() {
            trace!(job = %task.job_id(), mode = %task.mode(), "worker picked up job");
            task.run();
        }
    }

    /// Join a thread with timeout, detach if stuck.
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let start = Instant::now();
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                debug!(thread = ?handle.thread().name(), "worker did not exit in time, detaching");
                drop(handle);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl WorkerPool for ThreadPool {
    fn execute(&self, task: Dispatch) -> Result<(), Dispatch> {
        match self.task_tx.read().as_ref() {
            Some(tx) => tx.send(task).map_err(|err| err.into_inner()),
            None => Err(task),
        }
    }

    fn shutdown(&self) {
        // Dropping the sender lets workers drain what was already handed off
        if self.task_tx.write().take().is_none() {
            return;
        }

        let current = thread::current().id();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            // A job that drops the last reference to its fiber runs shutdown on a worker
            if handle.thread().id() == current {
                continue;
            }
            Self::join_with_timeout(handle, self.join_timeout);
        }
        debug!(size = self.size, "worker pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

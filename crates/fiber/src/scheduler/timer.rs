//! Timer thread for deferred submissions
//!
//! The timer thread sleeps until the nearest deadline with a condvar timeout
//! and runs due actions on itself, outside the lock.

use crate::error::{FiberError, FiberResult};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Action run by a [`Timer`] once its delay has elapsed
pub type TimerAction = Box<dyn FnOnce() + Send + 'static>;

/// Invokes actions after a delay
pub trait Timer: Send + Sync + 'static {
    /// Run `action` once `delay` has elapsed. Gives the action back if the
    /// timer has shut down.
    fn after(&self, delay: Duration, action: TimerAction) -> Result<(), TimerAction>;

    /// Stop the timer. Pending actions are dropped without running.
    fn shutdown(&self) {}
}

/// Entry in the timer heap
struct TimerEntry {
    /// When to fire
    deadline: Instant,
    /// Registration order, breaks ties between equal deadlines
    seq: u64,
    action: TimerAction,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Timer thread state
struct TimerState {
    /// Pending actions, sorted by deadline (min-heap)
    pending: BinaryHeap<TimerEntry>,
    /// Next registration sequence number
    next_seq: u64,
}

/// Single background thread that fires delayed actions
pub struct TimerThread {
    /// Internal state protected by mutex
    state: Mutex<TimerState>,
    /// Condvar to wake timer thread when new entry added or shutdown
    notify: Condvar,
    /// Shutdown signal
    shutdown: AtomicBool,
    /// Thread handle
    handle: Mutex<Option<JoinHandle<()>>>,
    /// How long shutdown waits for the thread
    join_timeout: Duration,
}

impl TimerThread {
    /// Create a new timer thread (not yet started)
    pub fn new(join_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimerState {
                pending: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
            join_timeout,
        })
    }

    /// Start the timer thread
    pub fn start(self: &Arc<Self>, name: &str) -> FiberResult<()> {
        let timer = Arc::clone(self);

        let handle = thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || {
                timer.run_loop();
            })
            .map_err(FiberError::ThreadSpawn)?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Number of actions waiting to fire
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Timer thread main loop
    fn run_loop(&self) {
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let mut state = self.state.lock();

            // shutdown() flips the flag under this lock
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = state.pending.peek() {
                if entry.deadline > now {
                    break;
                }
                if let Some(entry) = state.pending.pop() {
                    due.push(entry.action);
                }
            }

            if !due.is_empty() {
                // Actions may register new entries; run them unlocked
                drop(state);
                trace!(count = due.len(), "timer firing actions");
                for action in due {
                    action();
                }
                continue;
            }

            if let Some(next) = state.pending.peek() {
                let deadline = next.deadline;
                // Wakes early if a nearer entry is added
                self.notify.wait_until(&mut state, deadline);
            } else {
                self.notify.wait(&mut state);
            }
        }

        // Dropping pending actions lets their owners observe the shutdown
        let pending = std::mem::take(&mut self.state.lock().pending);
        debug!(dropped = pending.len(), "timer thread shutting down");
    }
}

impl Timer for TimerThread {
    fn after(&self, delay: Duration, action: TimerAction) -> Result<(), TimerAction> {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        if self.shutdown.load(AtomicOrdering::Acquire) {
            return Err(action);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(TimerEntry {
            deadline,
            seq,
            action,
        });
        self.notify.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        {
            let _state = self.state.lock();
            self.shutdown.store(true, AtomicOrdering::Release);
            self.notify.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let start = Instant::now();
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > self.join_timeout {
                    drop(handle);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

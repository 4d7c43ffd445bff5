//! Deadline timer thread.
//!
//! One dedicated thread waits on a condvar until the earliest deadline in a
//! min-heap falls due, then runs the due jobs. Jobs must be quick: they hand
//! work to the executor and never run tasks themselves. Used for delayed
//! submissions, recurring ticks, and the shutdown watchdog.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::core::error::KernelError;

type TimerJob = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    fire_at: Instant,
    /// FIFO tie-break for equal deadlines.
    seq: u64,
    job: TimerJob,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest deadline sits on top of the max-heap.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Handle to the timer thread.
pub(crate) struct TimerThread {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Spawn the timer thread.
    pub(crate) fn spawn() -> Result<Self, KernelError> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let loop_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("kernel-timer".into())
            .spawn(move || timer_loop(&loop_inner))
            .map_err(|e| KernelError::Internal(format!("failed to spawn timer thread: {e}")))?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedule `job` to run at `fire_at` (immediately if already past).
    pub(crate) fn schedule(&self, fire_at: Instant, job: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            debug!("timer is shut down; job dropped");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimerEntry {
            fire_at,
            seq,
            job: Box::new(job),
        });
        drop(state);
        self.inner.cv.notify_one();
    }

    /// Schedule `job` to run after `delay`.
    pub(crate) fn schedule_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        self.schedule(Instant::now() + delay, job);
    }

    /// Stop the timer thread; pending entries are dropped.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.inner.cv.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        // Signal the thread but do not join in Drop; a blocked join here
        // would stall whatever owns the timer.
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        drop(state);
        self.inner.cv.notify_all();
    }
}

fn timer_loop(inner: &Arc<TimerInner>) {
    debug!("timer thread started");
    loop {
        let mut due: Vec<TimerEntry> = Vec::new();
        {
            let mut state = inner.state.lock();
            if state.shutdown {
                break;
            }

            let now = Instant::now();
            loop {
                let is_due = state.heap.peek().is_some_and(|entry| entry.fire_at <= now);
                if !is_due {
                    break;
                }
                if let Some(entry) = state.heap.pop() {
                    due.push(entry);
                }
            }

            if due.is_empty() {
                match state.heap.peek().map(|entry| entry.fire_at) {
                    Some(fire_at) => {
                        inner.cv.wait_until(&mut state, fire_at);
                    }
                    None => {
                        inner.cv.wait(&mut state);
                    }
                }
                continue;
            }
        }

        // Run due jobs outside the lock so jobs may schedule further entries.
        for entry in due {
            (entry.job)();
        }
    }
    debug!("timer thread exiting");
}

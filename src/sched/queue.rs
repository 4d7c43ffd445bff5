//! FIFO dependency queues.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::core::error::KernelError;
use crate::core::task::{Identity, KernelTask};
use crate::sched::record::TaskRecord;
use crate::sched::Dispatch;

/// A dependency chain of tasks: strict submission order, and the next task is
/// only handed to the scheduler after the current one's execution reaches a
/// terminal outcome. At most one task from a queue runs at any time.
///
/// The queue itself has no owner; each task keeps the owner supplied at
/// [`add_task`](Self::add_task). An empty queue is simply idle and holds no
/// resources.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    target: Arc<dyn Dispatch>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<TaskRecord>,
    running: bool,
}

impl TaskQueue {
    pub(crate) fn new(target: Arc<dyn Dispatch>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                target,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Append a task to the queue. If the queue is idle the task is submitted
    /// to the scheduler immediately; otherwise it waits for its predecessors.
    ///
    /// # Errors
    ///
    /// Surfaces the scheduler's submission failure when the queue was idle
    /// and the head task could not be handed to the executor; the task is
    /// not retained in that case.
    pub fn add_task(&self, task: Arc<dyn KernelTask>, owner: Identity) -> Result<(), KernelError> {
        let mut record = TaskRecord::new(task, owner, 0, false);
        record.queue = Some(Arc::clone(&self.inner));

        self.inner
            .target
            .shared()
            .counters
            .submitted
            .fetch_add(1, Ordering::Relaxed);

        let head = {
            let mut state = self.inner.state.lock();
            if state.running {
                state.pending.push_back(record);
                None
            } else {
                state.running = true;
                Some(record)
            }
        };

        if let Some(record) = head {
            if let Err(err) = Arc::clone(&self.inner.target).dispatch_record(record) {
                self.inner.state.lock().running = false;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Number of tasks waiting behind the currently running one.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether the queue has no running or waiting task.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        !state.running && state.pending.is_empty()
    }
}

impl QueueInner {
    /// Called by the scheduler once the current task's execution (including
    /// all retries) terminally succeeded or permanently failed.
    pub(crate) fn task_done(&self) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(record) => Some(record),
                    None => {
                        state.running = false;
                        None
                    }
                }
            };
            let Some(record) = next else { return };
            match Arc::clone(&self.target).dispatch_record(record) {
                Ok(()) => return,
                Err(err) => {
                    self.target
                        .shared()
                        .counters
                        .failed
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "next queued task could not be submitted; trying the one after");
                }
            }
        }
    }
}

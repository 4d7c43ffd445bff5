//! Handles for periodically recurring tasks.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::error::KernelError;
use crate::sched::record::TaskRecord;
use crate::sched::timer::TimerThread;
use crate::sched::Dispatch;
use crate::util::clock::deadline_for;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a recurring task.
///
/// The task does not start running until [`start`](Self::start) is called;
/// from then on a tick fires at the start time and every period thereafter
/// until [`cancel`](Self::cancel). Each tick is a best-effort submission:
/// when the scheduler cannot admit the task at that moment the tick is
/// skipped and the next one is still attempted. A recurrence never dies
/// because of one rejected tick.
///
/// Cancellation only prevents future ticks; an execution already submitted
/// or in flight completes normally.
pub struct RecurringTaskHandle {
    inner: Arc<RecurringInner>,
}

impl std::fmt::Debug for RecurringTaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringTaskHandle")
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

struct RecurringInner {
    state: AtomicU8,
    record: TaskRecord,
    target: Arc<dyn Dispatch>,
    timer: Arc<TimerThread>,
}

impl RecurringTaskHandle {
    pub(crate) fn new(
        record: TaskRecord,
        target: Arc<dyn Dispatch>,
        timer: Arc<TimerThread>,
    ) -> Self {
        Self {
            inner: Arc::new(RecurringInner {
                state: AtomicU8::new(CREATED),
                record,
                target,
                timer,
            }),
        }
    }

    /// Start the recurrence.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] if already started or cancelled.
    pub fn start(&self) -> Result<(), KernelError> {
        self.inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| {
                let what = if actual == RUNNING {
                    "already started"
                } else {
                    "already cancelled"
                };
                KernelError::InvalidState(format!("recurring task {what}"))
            })?;
        schedule_tick(
            Arc::clone(&self.inner),
            deadline_for(self.inner.record.start_at_ms),
        );
        Ok(())
    }

    /// Cancel the recurrence; valid before or after `start`.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] if already cancelled.
    pub fn cancel(&self) -> Result<(), KernelError> {
        let prev = self.inner.state.swap(CANCELLED, Ordering::AcqRel);
        if prev == CANCELLED {
            return Err(KernelError::InvalidState(
                "recurring task already cancelled".into(),
            ));
        }
        Ok(())
    }

    /// Whether the handle has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }
}

fn schedule_tick(inner: Arc<RecurringInner>, fire_at: Instant) {
    let timer = Arc::clone(&inner.timer);
    timer.schedule(fire_at, move || {
        if inner.state.load(Ordering::Acquire) != RUNNING {
            debug!(
                task = inner.record.base_task_type(),
                "recurring task cancelled; no further ticks"
            );
            return;
        }

        let shared = inner.target.shared();
        match shared.admission.admit(&inner.record.owner) {
            Ok(()) => {
                shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                let mut tick = inner.record.clone();
                tick.charged = true;
                tick.start_at_ms = 0;
                if let Err(err) = Arc::clone(&inner.target).dispatch_record(tick) {
                    shared.admission.release(&inner.record.owner);
                    shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error = %err,
                        task = inner.record.base_task_type(),
                        "recurring tick could not be submitted"
                    );
                }
            }
            Err(err) => {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %err,
                    task = inner.record.base_task_type(),
                    "recurring tick skipped"
                );
            }
        }

        // Fixed-rate schedule: the next tick is relative to this tick's
        // deadline, not to when the submission attempt finished.
        let period = Duration::from_millis(inner.record.period_ms.unwrap_or(0).max(1));
        let next = fire_at + period;
        schedule_tick(inner, next);
    });
}

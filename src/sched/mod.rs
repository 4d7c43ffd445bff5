//! Task scheduling: admission control, reservations, recurring handles,
//! dependency queues, and the two scheduler front-ends.

pub(crate) mod admission;
pub mod queue;
pub(crate) mod record;
pub mod recurring;
pub mod reservation;
pub mod task_scheduler;
pub(crate) mod timer;
pub mod transaction_scheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::error::KernelError;
use crate::runtime::Executor;
use crate::sched::admission::AdmissionControl;
use crate::sched::record::TaskRecord;
use crate::sched::timer::TimerThread;

pub use queue::TaskQueue;
pub use recurring::RecurringTaskHandle;
pub use reservation::TaskReservation;
pub use task_scheduler::TaskScheduler;
pub use transaction_scheduler::TransactionScheduler;

/// Snapshot of a scheduler's activity counters.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Tasks accepted for execution (including recurring ticks).
    pub submitted: u64,
    /// Tasks that terminally succeeded.
    pub completed: u64,
    /// Tasks that terminally failed.
    pub failed: u64,
    /// Individual retry attempts.
    pub retried: u64,
    /// Submissions refused by admission or the executor.
    pub rejected: u64,
    /// Capacity units currently charged (queued, reserved, or running).
    pub in_flight: u32,
}

/// Lock-free activity counters behind the stats snapshot.
#[derive(Default)]
pub(crate) struct StatCounters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) rejected: AtomicU64,
}

impl StatCounters {
    pub(crate) fn snapshot(&self, in_flight: u32) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// State shared by a scheduler's submission paths.
pub(crate) struct SchedulerShared {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) timer: Arc<TimerThread>,
    pub(crate) admission: AdmissionControl,
    pub(crate) counters: StatCounters,
}

impl SchedulerShared {
    /// Book-keeping common to every terminal outcome: return the capacity
    /// charge and let the record's dependency queue move on.
    pub(crate) fn finish_record(&self, record: &TaskRecord) {
        if record.charged {
            self.admission.release(&record.owner);
        }
        if let Some(queue) = &record.queue {
            queue.task_done();
        }
    }
}

/// Internal seam between the submission surfaces (queues, reservations,
/// recurring handles) and a concrete scheduler's execution pipeline.
pub(crate) trait Dispatch: Send + Sync {
    /// Hand a record to the execution pipeline, honoring its start time.
    /// A start time in the past means immediate submission.
    fn dispatch_record(self: Arc<Self>, record: TaskRecord) -> Result<(), KernelError>;

    /// The scheduler's shared submission state.
    fn shared(&self) -> &SchedulerShared;
}

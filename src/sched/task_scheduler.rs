//! The non-transactional scheduler for long-running work.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::KernelConfig;
use crate::core::error::{KernelError, TaskError};
use crate::core::task::{Identity, KernelTask, TaskContext};
use crate::runtime::Executor;
use crate::sched::admission::AdmissionControl;
use crate::sched::record::TaskRecord;
use crate::sched::timer::TimerThread;
use crate::sched::{
    Dispatch, RecurringTaskHandle, SchedulerShared, SchedulerStats, StatCounters, TaskQueue,
    TaskReservation,
};
use crate::util::clock::deadline_for;

/// Schedules tasks that may take arbitrarily long to complete.
///
/// Same submission surface as the transactional scheduler, but tasks are
/// handed straight to the executor with no transaction wrapping and no
/// conflict-based retry: an error simply terminates that execution (logged
/// and counted). Because tasks may run any length of time, there is no
/// guarantee about when a given task starts; scheduling only says when the
/// kernel starts trying to acquire resources for it.
///
/// Dependency queues created here still run one task at a time, ordered by
/// completion of the previous execution (success or failure).
pub struct TaskScheduler {
    inner: Arc<TaskSchedInner>,
}

pub(crate) struct TaskSchedInner {
    shared: SchedulerShared,
}

impl TaskScheduler {
    pub(crate) fn new(
        executor: Arc<dyn Executor>,
        timer: Arc<TimerThread>,
        config: &KernelConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TaskSchedInner {
                shared: SchedulerShared {
                    executor,
                    timer,
                    admission: AdmissionControl::new(
                        config.max_ready_tasks,
                        config.max_tasks_per_owner,
                    ),
                    counters: StatCounters::default(),
                },
            }),
        }
    }

    /// Schedule a task to run as soon as possible.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskRejected`] if admission or the executor refuses.
    pub fn schedule_task(
        &self,
        task: Arc<dyn KernelTask>,
        owner: Identity,
    ) -> Result<(), KernelError> {
        self.schedule_task_at(task, owner, 0)
    }

    /// Schedule a task to run at `start_at_ms` (epoch milliseconds); a start
    /// time already in the past means immediate execution.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskRejected`] if admission or the executor refuses.
    pub fn schedule_task_at(
        &self,
        task: Arc<dyn KernelTask>,
        owner: Identity,
        start_at_ms: u128,
    ) -> Result<(), KernelError> {
        if let Err(err) = self.inner.shared.admission.admit(&owner) {
            self.inner.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        self.inner.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let record = TaskRecord::new(task, owner.clone(), start_at_ms, true);
        match Arc::clone(&self.inner).dispatch_record(record) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.shared.admission.release(&owner);
                self.inner.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Reserve the ability to run the given task.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskRejected`] if a reservation cannot be made.
    pub fn reserve_task(
        &self,
        task: Arc<dyn KernelTask>,
        owner: Identity,
    ) -> Result<TaskReservation, KernelError> {
        self.reserve_task_at(task, owner, 0)
    }

    /// Reserve the ability to run the given task at a point in the future.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskRejected`] if a reservation cannot be made.
    pub fn reserve_task_at(
        &self,
        task: Arc<dyn KernelTask>,
        owner: Identity,
        start_at_ms: u128,
    ) -> Result<TaskReservation, KernelError> {
        if let Err(err) = self.inner.shared.admission.admit(&owner) {
            self.inner.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        let record = TaskRecord::new(task, owner, start_at_ms, true);
        let target: Arc<dyn Dispatch> = self.inner.clone();
        Ok(TaskReservation::new(record, target))
    }

    /// Schedule a recurring task; nothing runs until the handle is started,
    /// and admission is deferred to each periodic tick.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] if `period_ms` is zero.
    pub fn schedule_recurring_task(
        &self,
        task: Arc<dyn KernelTask>,
        owner: Identity,
        start_at_ms: u128,
        period_ms: u64,
    ) -> Result<RecurringTaskHandle, KernelError> {
        if period_ms == 0 {
            return Err(KernelError::InvalidArgument(
                "recurring period must be greater than zero".into(),
            ));
        }
        let mut record = TaskRecord::new(task, owner, start_at_ms, false);
        record.period_ms = Some(period_ms);
        let target: Arc<dyn Dispatch> = self.inner.clone();
        Ok(RecurringTaskHandle::new(
            record,
            target,
            Arc::clone(&self.inner.shared.timer),
        ))
    }

    /// Create a new dependency queue bound to this scheduler. The next task
    /// is submitted once the previous execution completes, successfully or
    /// not.
    #[must_use]
    pub fn create_task_queue(&self) -> TaskQueue {
        let target: Arc<dyn Dispatch> = self.inner.clone();
        TaskQueue::new(target)
    }

    /// Snapshot of this scheduler's activity counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.inner
            .shared
            .counters
            .snapshot(self.inner.shared.admission.in_flight())
    }
}

impl TaskSchedInner {
    fn spawn_now(self: Arc<Self>, record: TaskRecord) -> Result<(), KernelError> {
        debug!(
            task = record.base_task_type(),
            owner = %record.owner,
            recurring = record.is_recurring(),
            "submitting task"
        );
        let me = Arc::clone(&self);
        self.shared
            .executor
            .submit(Box::new(move || me.run_record(&record)))
    }

    fn run_record(&self, record: &TaskRecord) {
        // A panicking task still counts as a failed execution and must not
        // skip the terminal book-keeping.
        let result = catch_unwind(AssertUnwindSafe(|| record.task.run(&TaskContext::detached())))
            .unwrap_or_else(|_| Err(TaskError::fatal("task panicked")));
        match result {
            Ok(()) => {
                self.shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    task = record.base_task_type(),
                    owner = %record.owner,
                    error = %err,
                    "task failed"
                );
            }
        }
        self.shared.finish_record(record);
    }
}

impl Dispatch for TaskSchedInner {
    fn dispatch_record(self: Arc<Self>, record: TaskRecord) -> Result<(), KernelError> {
        let deadline = deadline_for(record.start_at_ms);
        if deadline <= Instant::now() {
            return self.spawn_now(record);
        }

        let me = Arc::clone(&self);
        self.shared.timer.schedule(deadline, move || {
            let fallback = record.clone();
            if let Err(err) = Arc::clone(&me).spawn_now(record) {
                warn!(
                    error = %err,
                    task = fallback.base_task_type(),
                    "delayed task could not be submitted"
                );
                me.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                me.shared.finish_record(&fallback);
            }
        });
        Ok(())
    }

    fn shared(&self) -> &SchedulerShared {
        &self.shared
    }
}

//! The transactional scheduler: admission, timing, and conflict retry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{KernelConfig, RetryConfig};
use crate::core::error::{KernelError, TaskError};
use crate::core::task::{Identity, KernelTask, TaskContext};
use crate::core::transaction::{TransactionHandle, TransactionManager};
use crate::runtime::Executor;
use crate::sched::admission::AdmissionControl;
use crate::sched::record::TaskRecord;
use crate::sched::timer::TimerThread;
use crate::sched::{
    Dispatch, RecurringTaskHandle, SchedulerShared, SchedulerStats, StatCounters, TaskQueue,
    TaskReservation,
};
use crate::util::clock::{deadline_for, now_ms};

/// Schedules short-lived tasks for transactional execution, whether
/// immediate, delayed, or periodic.
///
/// Every task submitted here runs inside its own transaction and may be
/// re-tried on failure: when an attempt ends with a retry-eligible error
/// (a conflict abort, a failed commit, or a task error flagged retryable),
/// the same record is re-run until it succeeds or the attempt budget is
/// exhausted. A retry-eligible failure is never silently dropped; for
/// fire-and-forget submissions the terminal failure is logged and counted.
///
/// Submission methods make a best effort to accept the task; admission
/// policy (total capacity, per-owner quota) may refuse with
/// [`KernelError::TaskRejected`]. Callers that must be certain a task will
/// be accepted, typically transactional code that needs the guarantee
/// before it can commit, take a [`TaskReservation`] first.
pub struct TransactionScheduler {
    inner: Arc<TxnSchedInner>,
}

pub(crate) struct TxnSchedInner {
    shared: SchedulerShared,
    txn_manager: Arc<dyn TransactionManager>,
    retry: RetryConfig,
}

impl TransactionScheduler {
    pub(crate) fn new(
        txn_manager: Arc<dyn TransactionManager>,
        executor: Arc<dyn Executor>,
        timer: Arc<TimerThread>,
        config: &KernelConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TxnSchedInner {
                shared: SchedulerShared {
                    executor,
                    timer,
                    admission: AdmissionControl::new(
                        config.max_ready_tasks,
                        config.max_tasks_per_owner,
                    ),
                    counters: StatCounters::default(),
                },
                txn_manager,
                retry: config.retry.clone(),
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

    /// Schedule a task to run at `start_at_ms` (epoch milliseconds). A start
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
    /// Once granted, the capacity is held until the reservation is used (and
    /// the task terminally finishes) or cancelled.
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

    /// Schedule a task to run at `start_at_ms` and on a regular period from
    /// that point. Never rejected at call time (admission is deferred to
    /// each periodic tick), and nothing runs until the returned handle is
    /// started.
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

    /// Run the task synchronously in a new transaction, blocking the caller
    /// until it terminally succeeds or permanently fails.
    ///
    /// On task success the transaction is committed; a failed commit or a
    /// retry-eligible error re-runs the task per the retry policy, so this
    /// only returns once the task finally succeeds-and-commits or is no
    /// longer re-tried. The task runs on the caller's thread.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskRejected`] if admission refuses; otherwise the
    /// terminal execution error once retries are exhausted.
    pub fn run_task(&self, task: Arc<dyn KernelTask>, owner: Identity) -> Result<(), KernelError> {
        if let Err(err) = self.inner.shared.admission.admit(&owner) {
            self.inner.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        self.inner.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let record = TaskRecord::new(task, owner.clone(), 0, true);
        let result = self.inner.execute_with_retry(&record);
        match &result {
            Ok(()) => {
                self.inner.shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.shared.admission.release(&owner);
        result
    }

    /// Run the task as part of the caller's already-active transaction.
    ///
    /// Nested transactions are not supported, so no commit is attempted and
    /// no retry is applied here; both stay with the enclosing transaction.
    /// The owner is inherited from the handle. This is the explicit-context
    /// form of synchronous execution: callers pass the transaction they are
    /// in instead of relying on any ambient state.
    ///
    /// # Errors
    ///
    /// [`KernelError::TransactionState`] if `txn` is not active; otherwise
    /// any error the task returns, propagated immediately.
    pub fn run_task_in(
        &self,
        task: Arc<dyn KernelTask>,
        txn: &TransactionHandle,
    ) -> Result<(), KernelError> {
        if !self.inner.txn_manager.is_active(txn.id()) {
            return Err(KernelError::TransactionState(txn.id()));
        }
        task.run(&TaskContext::transactional(txn))
            .map_err(KernelError::TaskExecution)
    }

    /// Create a new dependency queue bound to this scheduler. Each task added
    /// runs in its own transaction with retry, and queue order is preserved
    /// across retries: the next task does not start until the current one's
    /// retries are exhausted.
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

impl TxnSchedInner {
    fn spawn_now(self: Arc<Self>, record: TaskRecord) -> Result<(), KernelError> {
        debug!(
            task = record.base_task_type(),
            owner = %record.owner,
            recurring = record.is_recurring(),
            "submitting transactional task"
        );
        let me = Arc::clone(&self);
        self.shared
            .executor
            .submit(Box::new(move || me.run_record(&record)))
    }

    fn run_record(&self, record: &TaskRecord) {
        match self.execute_with_retry(record) {
            Ok(()) => {
                self.shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    task = record.base_task_type(),
                    owner = %record.owner,
                    error = %err,
                    "task failed permanently"
                );
            }
        }
        self.shared.finish_record(record);
    }

    /// One transaction per attempt; retry while the failure is retry-eligible
    /// and the attempt budget lasts, with exponential backoff between
    /// attempts (a task-suggested backoff takes precedence).
    fn execute_with_retry(&self, record: &TaskRecord) -> Result<(), KernelError> {
        let mut attempt: u32 = 0;
        let mut backoff = Duration::from_millis(self.retry.initial_backoff_ms);
        loop {
            attempt += 1;
            let txn = self.txn_manager.begin(record.owner.clone());
            let age_ms =
                u64::try_from(now_ms().saturating_sub(record.submitted_at_ms)).unwrap_or(u64::MAX);
            debug!(
                txn = %txn.id(),
                attempt,
                task = record.base_task_type(),
                age_ms,
                "running transactional attempt"
            );

            // A panicking task is treated as a fatal failure; it must not
            // leak the transaction or the admission charge.
            let run_result = catch_unwind(AssertUnwindSafe(|| {
                record.task.run(&TaskContext::transactional(&txn))
            }))
            .unwrap_or_else(|_| Err(TaskError::fatal("task panicked")));

            let (outcome, suggested): (Result<(), KernelError>, Option<Duration>) =
                match run_result {
                    Ok(()) => (self.txn_manager.commit(&txn), None),
                    Err(task_err) => {
                        let suggested = task_err.suggested_backoff();
                        self.txn_manager
                            .abort(txn.id(), "task failed", task_err.is_retry_eligible());
                        self.txn_manager.release(txn.id());
                        (Err(KernelError::TaskExecution(task_err)), suggested)
                    }
                };

            match outcome {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if err.is_retry_eligible() && attempt < self.retry.max_attempts {
                        self.shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                        let wait = suggested.unwrap_or(backoff);
                        debug!(
                            attempt,
                            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                            "retrying after transactional failure"
                        );
                        thread::sleep(wait);
                        backoff =
                            (backoff * 2).min(Duration::from_millis(self.retry.max_backoff_ms));
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }
}

impl Dispatch for TxnSchedInner {
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

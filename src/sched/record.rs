//! Internal task records tracked by the schedulers.

use std::sync::Arc;

use crate::core::task::{Identity, KernelTask};
use crate::sched::queue::QueueInner;
use crate::util::clock::now_ms;

/// Everything a scheduler needs to know about one submitted task.
///
/// Created at submit/reserve time, cloned for recurring ticks, and dropped
/// once the task (including all retries) terminally finishes or is cancelled.
#[derive(Clone)]
pub(crate) struct TaskRecord {
    pub(crate) task: Arc<dyn KernelTask>,
    pub(crate) owner: Identity,
    pub(crate) submitted_at_ms: u128,
    /// Epoch milliseconds; 0 (or any past time) means "run now".
    pub(crate) start_at_ms: u128,
    pub(crate) period_ms: Option<u64>,
    /// Whether this record holds a unit of admission capacity that must be
    /// released at terminal completion. Queue-driven and recurring base
    /// records do not.
    pub(crate) charged: bool,
    /// Dependency queue to notify once this record reaches a terminal
    /// outcome.
    pub(crate) queue: Option<Arc<QueueInner>>,
}

impl TaskRecord {
    pub(crate) fn new(
        task: Arc<dyn KernelTask>,
        owner: Identity,
        start_at_ms: u128,
        charged: bool,
    ) -> Self {
        Self {
            task,
            owner,
            submitted_at_ms: now_ms(),
            start_at_ms,
            period_ms: None,
            charged,
            queue: None,
        }
    }

    pub(crate) fn is_recurring(&self) -> bool {
        self.period_ms.is_some()
    }

    pub(crate) fn base_task_type(&self) -> &str {
        self.task.base_task_type()
    }
}

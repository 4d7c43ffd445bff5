//! The task contract and owner identity.

use std::fmt;
use std::sync::Arc;

use crate::core::error::TaskError;
use crate::core::transaction::TransactionHandle;

/// A unit of work submitted to a scheduler.
///
/// Tasks are immutable, re-runnable values: ownership passes to the scheduler
/// at submission and a task may be executed several times if its transaction
/// is retried, so `run` takes `&self`.
///
/// Many runnables wrap other runnables. [`base_task_type`] must return the
/// identifier of the innermost task regardless of how many wrapping layers
/// surround it, so monitoring can attribute nested tasks to one logical type.
/// Wrappers achieve this by storing the inner task and forwarding the call;
/// there is no runtime type inspection involved.
///
/// [`base_task_type`]: KernelTask::base_task_type
pub trait KernelTask: Send + Sync + 'static {
    /// Stable identifier of the base (innermost) task type.
    fn base_task_type(&self) -> &str;

    /// Runs the task.
    ///
    /// When run by a scheduler that supports retry, a returned [`TaskError`]
    /// with retry eligibility set will cause the task to be re-run per the
    /// scheduler's policy.
    fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError>;
}

/// Execution context handed to a running task.
///
/// Carries the current transaction explicitly; tasks running on the
/// non-transactional scheduler see no transaction. The context is how a
/// task's data layer finds the transaction to report accesses against.
pub struct TaskContext<'a> {
    txn: Option<&'a TransactionHandle>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn transactional(txn: &'a TransactionHandle) -> Self {
        Self { txn: Some(txn) }
    }

    pub(crate) fn detached() -> Self {
        Self { txn: None }
    }

    /// The transaction this task runs in, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&'a TransactionHandle> {
        self.txn
    }
}

/// Fully-qualified type name, for use as a [`KernelTask::base_task_type`].
#[must_use]
pub fn task_type_name<T: ?Sized>() -> &'static str {
    std::any::type_name::<T>()
}

/// Adapter building a [`KernelTask`] from a closure.
pub struct FnTask<F> {
    task_type: String,
    body: F,
}

impl<F> FnTask<F>
where
    F: Fn(&TaskContext<'_>) -> Result<(), TaskError> + Send + Sync + 'static,
{
    /// Create a task with the given base type identifier and body.
    pub fn new(task_type: impl Into<String>, body: F) -> Self {
        Self {
            task_type: task_type.into(),
            body,
        }
    }
}

impl<F> KernelTask for FnTask<F>
where
    F: Fn(&TaskContext<'_>) -> Result<(), TaskError> + Send + Sync + 'static,
{
    fn base_task_type(&self) -> &str {
        &self.task_type
    }

    fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        (self.body)(ctx)
    }
}

/// Opaque owner principal a task is attributed to.
///
/// Supplied by the identity provider; the kernel only relies on value
/// equality, hashing and display, and never dereferences it further.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Identity(Arc<str>);

impl Identity {
    /// Wrap a principal name.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The principal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Runtime adapters: the executor abstraction and the thread-pool executor.

pub mod thread_pool;

use std::time::Duration;

use crate::core::error::KernelError;

pub use thread_pool::ThreadPoolExecutor;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The consumed executor contract: submit a callable, it starts
/// asynchronously on some worker; completion is observed by the job itself.
pub trait Executor: Send + Sync {
    /// Submit a job for asynchronous execution.
    ///
    /// # Errors
    ///
    /// [`KernelError::TaskRejected`] if the executor cannot accept more work
    /// (queue full or shut down).
    fn submit(&self, job: Job) -> Result<(), KernelError>;

    /// Stop accepting work and wind down, waiting up to `grace` per worker.
    fn shutdown(&self, grace: Duration);
}

//! Error types for kernel operations.

use std::time::Duration;

use thiserror::Error;

use crate::core::transaction::TxnId;

/// Errors produced by kernel components.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Admission control refused the task (capacity or owner quota).
    #[error("task rejected: {0}")]
    TaskRejected(String),
    /// The transaction was aborted, typically due to an access conflict.
    /// `retryable` tells schedulers whether resubmission is worthwhile.
    #[error("transaction {id} aborted: {reason}")]
    TransactionAborted {
        /// The aborted transaction.
        id: TxnId,
        /// Why the transaction was aborted.
        reason: String,
        /// Whether the failed work may be re-attempted.
        retryable: bool,
    },
    /// A call referenced a transaction that is not active or not known.
    #[error("transaction {0} is not active")]
    TransactionState(TxnId),
    /// A state-machine method was called from a state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Malformed input, e.g. a zero period for a recurring task.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An error surfaced from running a task.
    #[error(transparent)]
    TaskExecution(#[from] TaskError),
    /// Infrastructure failure (thread spawn, channel wiring).
    #[error("internal error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Whether a scheduler may re-attempt the failed work.
    ///
    /// Only execution-time failures carry retry eligibility; admission and
    /// state-machine failures are always terminal for the call that hit them.
    #[must_use]
    pub fn is_retry_eligible(&self) -> bool {
        match self {
            Self::TransactionAborted { retryable, .. } => *retryable,
            Self::TaskExecution(err) => err.is_retry_eligible(),
            _ => false,
        }
    }
}

/// Failure surfaced from [`KernelTask::run`](crate::core::task::KernelTask::run).
///
/// Retry eligibility is an explicit flag decided by the task or the data
/// layer that produced the error, not something schedulers infer from the
/// error type. A task may also suggest a backoff before the next attempt.
#[derive(Debug, Error)]
#[error("task failed: {source}")]
pub struct TaskError {
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
    retryable: bool,
    backoff: Option<Duration>,
}

impl TaskError {
    /// A terminal failure: the task must not be re-attempted.
    pub fn fatal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: err.into(),
            retryable: false,
            backoff: None,
        }
    }

    /// A transient failure: the scheduler may re-run the task.
    pub fn retryable(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: err.into(),
            retryable: true,
            backoff: None,
        }
    }

    /// Suggest how long the scheduler should wait before the next attempt.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Whether the task asked to be re-attempted.
    #[must_use]
    pub fn is_retry_eligible(&self) -> bool {
        self.retryable
    }

    /// Backoff suggested by the task, if any.
    #[must_use]
    pub fn suggested_backoff(&self) -> Option<Duration> {
        self.backoff
    }
}

impl From<KernelError> for TaskError {
    /// Kernel failures hit inside `run()` (e.g. a conflict abort reported by
    /// the data layer) keep their retry eligibility when they propagate out.
    fn from(err: KernelError) -> Self {
        let retryable = err.is_retry_eligible();
        Self {
            source: Box::new(err),
            retryable,
            backoff: None,
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

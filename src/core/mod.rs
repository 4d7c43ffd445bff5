//! Core task, transaction, and error abstractions.

pub mod error;
pub mod task;
pub mod transaction;

pub use error::{AppResult, KernelError, TaskError};
pub use task::{task_type_name, FnTask, Identity, KernelTask, TaskContext};
pub use transaction::{
    InMemoryTransactionManager, TransactionHandle, TransactionManager, TransactionObserver,
    TxnId, TxnStatus,
};

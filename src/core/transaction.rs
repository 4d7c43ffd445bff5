//! Transaction identity and the transaction-manager contract.
//!
//! The kernel does not own begin/commit/abort mechanics; it consumes them
//! through [`TransactionManager`]. [`InMemoryTransactionManager`] is the
//! default in-process implementation used by the kernel bootstrap and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::core::error::KernelError;
use crate::core::task::Identity;

/// Unique transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Handle to an active transaction.
///
/// `seq` is the monotonic begin order assigned by the manager; the access
/// coordinator uses it as the deterministic conflict tie-break (lower seq =
/// older transaction = winner).
#[derive(Clone, Debug)]
pub struct TransactionHandle {
    id: TxnId,
    seq: u64,
    owner: Identity,
}

impl TransactionHandle {
    /// The transaction identifier.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Begin-order sequence number.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The owner the transaction is attributed to.
    #[must_use]
    pub fn owner(&self) -> &Identity {
        &self.owner
    }
}

/// Observed state of a transaction.
#[derive(Clone, Debug)]
pub enum TxnStatus {
    /// The transaction is active.
    Active,
    /// The transaction was aborted and the outcome not yet reaped.
    Aborted {
        /// Why the transaction was aborted.
        reason: String,
        /// Whether the aborted work may be re-attempted.
        retryable: bool,
    },
    /// The transaction is not known to the manager.
    Unknown,
}

/// Callback invoked when a transaction reaches a terminal state through the
/// manager's public paths, so per-transaction state held elsewhere (the
/// access coordinator's tables) is discarded at commit/abort time.
pub trait TransactionObserver: Send + Sync {
    /// The transaction committed or was aborted.
    fn transaction_finished(&self, id: TxnId);
}

/// The consumed transaction-manager contract.
///
/// `try_abort` exists for conflict arbitration: the access coordinator must
/// decide a conflict and abort the loser atomically with respect to that
/// loser committing. It transitions the transaction without notifying the
/// observer (the coordinator purges its own tables inline) and reports
/// whether the transition happened; `false` means the transaction already
/// reached a terminal state and must not be treated as a conflict victim.
pub trait TransactionManager: Send + Sync {
    /// Begin a new transaction on behalf of `owner`.
    fn begin(&self, owner: Identity) -> TransactionHandle;

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// [`KernelError::TransactionAborted`] if the transaction was aborted
    /// before the commit (carrying the stored reason and retry eligibility);
    /// [`KernelError::TransactionState`] if it is unknown. Either way the
    /// transaction is finished once this returns.
    fn commit(&self, txn: &TransactionHandle) -> Result<(), KernelError>;

    /// Abort the transaction. A no-op if it is already terminal or unknown.
    fn abort(&self, id: TxnId, reason: &str, retryable: bool);

    /// Atomically abort an active transaction without observer notification.
    /// Returns whether the transition from active happened.
    fn try_abort(&self, id: TxnId, reason: &str, retryable: bool) -> bool;

    /// Current state of the transaction.
    fn status(&self, id: TxnId) -> TxnStatus;

    /// Whether the transaction is currently active.
    fn is_active(&self, id: TxnId) -> bool {
        matches!(self.status(id), TxnStatus::Active)
    }

    /// Drop the terminal record of an aborted transaction once its owner has
    /// observed the outcome. Active or unknown transactions are untouched.
    fn release(&self, id: TxnId);
}

enum TxnState {
    Active,
    Aborted { reason: String, retryable: bool },
}

/// In-process [`TransactionManager`].
///
/// Aborted transactions are kept as tombstones until the owning scheduler
/// reads the outcome (`commit` or `release` reaps them), so a victim aborted
/// by the coordinator still observes the reason and retry eligibility.
pub struct InMemoryTransactionManager {
    next_seq: AtomicU64,
    txns: Mutex<HashMap<TxnId, TxnState>>,
    observer: Mutex<Option<Weak<dyn TransactionObserver>>>,
}

impl InMemoryTransactionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            txns: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
        }
    }

    /// Register the observer notified on commit/abort. One slot; the last
    /// registration wins.
    pub fn set_observer(&self, observer: Weak<dyn TransactionObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Notify the observer outside any manager lock.
    fn notify_finished(&self, id: TxnId) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer.and_then(|weak| weak.upgrade()) {
            observer.transaction_finished(id);
        }
    }
}

impl Default for InMemoryTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn begin(&self, owner: Identity) -> TransactionHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = TxnId::new();
        self.txns.lock().insert(id, TxnState::Active);
        debug!(txn = %id, seq, owner = %owner, "transaction started");
        TransactionHandle { id, seq, owner }
    }

    fn commit(&self, txn: &TransactionHandle) -> Result<(), KernelError> {
        let outcome = self.txns.lock().remove(&txn.id);
        match outcome {
            Some(TxnState::Active) => {
                self.notify_finished(txn.id);
                debug!(txn = %txn.id, "transaction committed");
                Ok(())
            }
            Some(TxnState::Aborted { reason, retryable }) => {
                // The coordinator already discarded this transaction's
                // accesses when it was aborted; just surface the outcome.
                debug!(txn = %txn.id, %reason, retryable, "commit on aborted transaction");
                Err(KernelError::TransactionAborted {
                    id: txn.id,
                    reason,
                    retryable,
                })
            }
            None => Err(KernelError::TransactionState(txn.id)),
        }
    }

    fn abort(&self, id: TxnId, reason: &str, retryable: bool) {
        let transitioned = self.try_abort(id, reason, retryable);
        if transitioned {
            self.notify_finished(id);
            debug!(txn = %id, reason, retryable, "transaction aborted");
        }
    }

    fn try_abort(&self, id: TxnId, reason: &str, retryable: bool) -> bool {
        let mut txns = self.txns.lock();
        match txns.get_mut(&id) {
            Some(state @ TxnState::Active) => {
                *state = TxnState::Aborted {
                    reason: reason.to_string(),
                    retryable,
                };
                true
            }
            _ => false,
        }
    }

    fn status(&self, id: TxnId) -> TxnStatus {
        match self.txns.lock().get(&id) {
            Some(TxnState::Active) => TxnStatus::Active,
            Some(TxnState::Aborted { reason, retryable }) => TxnStatus::Aborted {
                reason: reason.clone(),
                retryable: *retryable,
            },
            None => TxnStatus::Unknown,
        }
    }

    fn release(&self, id: TxnId) {
        let mut txns = self.txns.lock();
        if matches!(txns.get(&id), Some(TxnState::Aborted { .. })) {
            txns.remove(&id);
        }
    }
}

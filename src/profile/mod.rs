//! Profiling listener extension point.
//!
//! Every recorded object access and every detected conflict is emitted to
//! registered listeners. Consumption is optional and strictly passive:
//! notification is fire-and-forget, and a panicking listener never affects
//! the reporting call's outcome.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::access::{AccessType, AccessedObject, ObjectId};
use crate::core::transaction::TxnId;

/// A single recorded object access, as seen by a transaction.
#[derive(Clone, Debug)]
pub struct AccessEvent {
    /// The transaction that reported the access.
    pub txn: TxnId,
    /// The recorded access.
    pub access: AccessedObject,
}

/// A resolved access conflict: `victim` was aborted so `winner` may proceed.
#[derive(Clone, Debug)]
pub struct ConflictEvent {
    /// The contended object.
    pub object_id: ObjectId,
    /// The access type whose report triggered the conflict.
    pub access_type: AccessType,
    /// The transaction that kept its access.
    pub winner: TxnId,
    /// The transaction that was aborted.
    pub victim: TxnId,
    /// Source name of the reporter that triggered the conflict.
    pub source: Arc<str>,
}

/// Passive consumer of access and conflict notifications.
pub trait ProfileListener: Send + Sync {
    /// A new object access was recorded.
    fn object_access(&self, event: &AccessEvent) {
        let _ = event;
    }

    /// A conflict was detected and resolved.
    fn conflict_detected(&self, event: &ConflictEvent) {
        let _ = event;
    }
}

/// Listener registry held by the access coordinator.
pub(crate) struct ProfileRegistry {
    listeners: RwLock<Vec<Arc<dyn ProfileListener>>>,
}

impl ProfileRegistry {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn ProfileListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn notify_access(&self, event: &AccessEvent) {
        // Snapshot first; listeners must never run under the registry lock.
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.object_access(event))).is_err() {
                debug!(txn = %event.txn, "profile listener panicked; access event dropped");
            }
        }
    }

    pub(crate) fn notify_conflict(&self, event: &ConflictEvent) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.conflict_detected(event))).is_err() {
                debug!(object = %event.object_id, "profile listener panicked; conflict event dropped");
            }
        }
    }
}

/// Bounded in-memory listener for tests and dev.
pub struct InMemoryProfileListener {
    max_events: usize,
    accesses: Mutex<VecDeque<AccessEvent>>,
    conflicts: Mutex<VecDeque<ConflictEvent>>,
}

impl InMemoryProfileListener {
    /// Create a listener keeping at most `max_events` of each kind.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events,
            accesses: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            conflicts: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
        }
    }

    /// Snapshot of recorded access events.
    #[must_use]
    pub fn accesses(&self) -> Vec<AccessEvent> {
        self.accesses.lock().iter().cloned().collect()
    }

    /// Snapshot of recorded conflict events.
    #[must_use]
    pub fn conflicts(&self) -> Vec<ConflictEvent> {
        self.conflicts.lock().iter().cloned().collect()
    }
}

impl ProfileListener for InMemoryProfileListener {
    fn object_access(&self, event: &AccessEvent) {
        let mut accesses = self.accesses.lock();
        if accesses.len() >= self.max_events {
            accesses.pop_front();
        }
        accesses.push_back(event.clone());
    }

    fn conflict_detected(&self, event: &ConflictEvent) {
        let mut conflicts = self.conflicts.lock();
        if conflicts.len() >= self.max_events {
            conflicts.pop_front();
        }
        conflicts.push_back(event.clone());
    }
}

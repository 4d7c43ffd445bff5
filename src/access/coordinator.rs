//! Shared-object access tracking and conflict arbitration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::access::object::{AccessType, AccessedObject, ObjectDescription, ObjectId};
use crate::access::reporter::AccessReporter;
use crate::core::error::KernelError;
use crate::core::transaction::{
    TransactionHandle, TransactionManager, TransactionObserver, TxnId, TxnStatus,
};
use crate::profile::{AccessEvent, ConflictEvent, ProfileListener, ProfileRegistry};

struct HolderInfo {
    access: AccessType,
    seq: u64,
}

struct ObjectEntry {
    first_idx: usize,
    read: bool,
    write: bool,
}

#[derive(Default)]
struct TxnAccesses {
    /// Ordered, monotonically growing set of recorded accesses.
    ordered: Vec<AccessedObject>,
    by_object: HashMap<ObjectId, ObjectEntry>,
    /// Descriptions supplied before the object's first report.
    pending_desc: HashMap<ObjectId, ObjectDescription>,
}

#[derive(Default)]
struct CoordinatorState {
    txns: HashMap<TxnId, TxnAccesses>,
    objects: HashMap<ObjectId, HashMap<TxnId, HolderInfo>>,
}

/// Tracks which transactions touched which shared objects and aborts the
/// losing side of any read/write conflict.
///
/// Two recorded accesses to the same object conflict iff at least one is a
/// write and they belong to different transactions. The tie-break is
/// deterministic: **the older transaction wins** (lower begin seq). Every
/// younger conflicting holder is aborted the moment the conflict is detected;
/// if the reporting transaction is the younger side, the report itself fails
/// with a retry-eligible [`KernelError::TransactionAborted`]. Because the
/// order is total and nobody ever waits for another transaction, the policy
/// is deadlock-free and the oldest transaction always makes progress.
///
/// Both tables live under one mutex, so recording an access and acting on the
/// conflict it creates are atomic with respect to concurrent reporters. The
/// lock is held only for the arbitration itself, never while a transaction
/// runs.
pub struct AccessCoordinator {
    txn_manager: Arc<dyn TransactionManager>,
    state: Mutex<CoordinatorState>,
    profile: ProfileRegistry,
}

impl AccessCoordinator {
    /// Create a coordinator arbitrating transactions of `txn_manager`.
    ///
    /// The caller is expected to register the coordinator as the manager's
    /// transaction observer so recorded accesses are discarded at
    /// commit/abort (the kernel builder wires this up).
    #[must_use]
    pub fn new(txn_manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            txn_manager,
            state: Mutex::new(CoordinatorState::default()),
            profile: ProfileRegistry::new(),
        }
    }

    /// Register an access source, producing the reporter façade its
    /// data-access code uses. All accesses reported through the returned
    /// reporter carry `source` for profiling attribution.
    pub fn register_source(self: &Arc<Self>, source: impl Into<Arc<str>>) -> AccessReporter {
        AccessReporter::new(Arc::clone(self), source.into())
    }

    /// Attach a passive profiling listener.
    pub fn add_profile_listener(&self, listener: Arc<dyn ProfileListener>) {
        self.profile.add(listener);
    }

    fn ensure_active(&self, id: TxnId) -> Result<(), KernelError> {
        match self.txn_manager.status(id) {
            TxnStatus::Active => Ok(()),
            TxnStatus::Aborted { reason, retryable } => Err(KernelError::TransactionAborted {
                id,
                reason,
                retryable,
            }),
            TxnStatus::Unknown => Err(KernelError::TransactionState(id)),
        }
    }

    pub(crate) fn report(
        &self,
        txn: &TransactionHandle,
        source: &Arc<str>,
        object_id: ObjectId,
        access_type: AccessType,
        description: Option<ObjectDescription>,
    ) -> Result<(), KernelError> {
        let mut access_event: Option<AccessEvent> = None;
        let mut conflict_events: Vec<ConflictEvent> = Vec::new();

        let result = self.report_locked(
            txn,
            source,
            object_id,
            access_type,
            description,
            &mut access_event,
            &mut conflict_events,
        );

        // Listeners are notified outside the lock; they must never be able to
        // slow down or fail another reporter.
        for event in &conflict_events {
            self.profile.notify_conflict(event);
        }
        if let Some(event) = &access_event {
            self.profile.notify_access(event);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn report_locked(
        &self,
        txn: &TransactionHandle,
        source: &Arc<str>,
        object_id: ObjectId,
        access_type: AccessType,
        description: Option<ObjectDescription>,
        access_event: &mut Option<AccessEvent>,
        conflict_events: &mut Vec<ConflictEvent>,
    ) -> Result<(), KernelError> {
        let mut guard = self.state.lock();
        self.ensure_active(txn.id())?;
        let state = &mut *guard;
        let txn_id = txn.id();
        let seq = txn.seq();

        // Re-reporting an identical access is a cheap no-op; the access set
        // only ever grows.
        let already_recorded = state.txns.get(&txn_id).is_some_and(|accesses| {
            accesses.by_object.get(&object_id).is_some_and(|entry| match access_type {
                AccessType::Read => entry.read,
                AccessType::Write => entry.write,
            })
        });
        if already_recorded {
            if let Some(description) = description {
                Self::attach_first_description(state, txn_id, &object_id, description);
            }
            return Ok(());
        }

        // Arbitrate against the object's current holders. Active holders are
        // mutually compatible, so either the caller is younger than some
        // conflicting holder (and yields), or every conflicting holder is
        // younger (and is aborted).
        let mut victims: Vec<TxnId> = Vec::new();
        let mut stale: Vec<TxnId> = Vec::new();
        let mut yields_to: Option<(TxnId, u64)> = None;
        if let Some(holders) = state.objects.get(&object_id) {
            for (&other, info) in holders {
                if other == txn_id {
                    continue;
                }
                if access_type != AccessType::Write && info.access != AccessType::Write {
                    continue;
                }
                match self.txn_manager.status(other) {
                    TxnStatus::Active => {
                        if info.seq < seq {
                            if yields_to.is_none_or(|(_, s)| info.seq < s) {
                                yields_to = Some((other, info.seq));
                            }
                        } else {
                            victims.push(other);
                        }
                    }
                    // Finished transactions no longer hold anything.
                    _ => stale.push(other),
                }
            }
        }

        for id in stale {
            purge_txn_locked(state, id);
        }

        if let Some((winner, _)) = yields_to {
            let reason = format!("{access_type} conflict on {object_id}");
            self.txn_manager.try_abort(txn_id, &reason, true);
            purge_txn_locked(state, txn_id);
            warn!(txn = %txn_id, %winner, object = %object_id, "transaction yielded to older holder");
            conflict_events.push(ConflictEvent {
                object_id,
                access_type,
                winner,
                victim: txn_id,
                source: Arc::clone(source),
            });
            return Err(KernelError::TransactionAborted {
                id: txn_id,
                reason,
                retryable: true,
            });
        }

        for victim in victims {
            let reason = format!("{access_type} conflict on {object_id}");
            if self.txn_manager.try_abort(victim, &reason, true) {
                debug!(winner = %txn_id, %victim, object = %object_id, "aborted younger holder");
                conflict_events.push(ConflictEvent {
                    object_id: object_id.clone(),
                    access_type,
                    winner: txn_id,
                    victim,
                    source: Arc::clone(source),
                });
            }
            // The holder reached a terminal state either way; drop its
            // recorded accesses.
            purge_txn_locked(state, victim);
        }

        // Record the access.
        let accesses = state.txns.entry(txn_id).or_default();
        let mut access = AccessedObject::new(object_id.clone(), access_type, Arc::clone(source));
        match accesses.by_object.get(&object_id).map(|e| e.first_idx) {
            Some(first_idx) => {
                // Second access type for an already-touched object; any new
                // description still belongs to the first-reported access.
                if let Some(description) = description {
                    accesses.ordered[first_idx].attach_description(description);
                }
            }
            None => {
                let description =
                    description.or_else(|| accesses.pending_desc.remove(&object_id));
                if let Some(description) = description {
                    access.attach_description(description);
                }
            }
        }
        let idx = accesses.ordered.len();
        accesses.ordered.push(access.clone());
        let entry = accesses.by_object.entry(object_id.clone()).or_insert(ObjectEntry {
            first_idx: idx,
            read: false,
            write: false,
        });
        match access_type {
            AccessType::Read => entry.read = true,
            AccessType::Write => entry.write = true,
        }

        let holder = state
            .objects
            .entry(object_id)
            .or_default()
            .entry(txn_id)
            .or_insert(HolderInfo {
                access: access_type,
                seq,
            });
        if access_type == AccessType::Write {
            holder.access = AccessType::Write;
        }

        *access_event = Some(AccessEvent {
            txn: txn_id,
            access,
        });
        Ok(())
    }

    pub(crate) fn set_description(
        &self,
        txn: &TransactionHandle,
        object_id: ObjectId,
        description: ObjectDescription,
    ) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        self.ensure_active(txn.id())?;
        let accesses = state.txns.entry(txn.id()).or_default();
        if let Some(first_idx) = accesses.by_object.get(&object_id).map(|e| e.first_idx) {
            accesses.ordered[first_idx].attach_description(description);
        } else {
            // Not reported yet; keep the description pending for the first
            // report. An existing pending description wins.
            accesses.pending_desc.entry(object_id).or_insert(description);
        }
        Ok(())
    }

    fn attach_first_description(
        state: &mut CoordinatorState,
        txn_id: TxnId,
        object_id: &ObjectId,
        description: ObjectDescription,
    ) {
        if let Some(accesses) = state.txns.get_mut(&txn_id) {
            if let Some(first_idx) = accesses.by_object.get(object_id).map(|e| e.first_idx) {
                accesses.ordered[first_idx].attach_description(description);
            }
        }
    }
}

impl TransactionObserver for AccessCoordinator {
    fn transaction_finished(&self, id: TxnId) {
        let mut state = self.state.lock();
        purge_txn_locked(&mut state, id);
    }
}

fn purge_txn_locked(state: &mut CoordinatorState, id: TxnId) {
    if let Some(accesses) = state.txns.remove(&id) {
        for access in &accesses.ordered {
            let now_empty = match state.objects.get_mut(access.object_id()) {
                Some(holders) => {
                    holders.remove(&id);
                    holders.is_empty()
                }
                None => false,
            };
            if now_empty {
                state.objects.remove(access.object_id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::core::task::Identity;
    use crate::core::transaction::InMemoryTransactionManager;
    use crate::profile::InMemoryProfileListener;

    fn setup() -> (
        Arc<InMemoryTransactionManager>,
        Arc<AccessCoordinator>,
        AccessReporter,
    ) {
        let manager = Arc::new(InMemoryTransactionManager::new());
        let dyn_manager: Arc<dyn TransactionManager> = manager.clone();
        let coordinator = Arc::new(AccessCoordinator::new(dyn_manager));
        let coordinator_observer: Arc<dyn TransactionObserver> = coordinator.clone();
        let weak: Weak<dyn TransactionObserver> = Arc::downgrade(&coordinator_observer);
        manager.set_observer(weak);
        let reporter = coordinator.register_source("data-service");
        (manager, coordinator, reporter)
    }

    #[test]
    fn concurrent_reads_do_not_conflict() {
        let (manager, _coordinator, reporter) = setup();
        let a = manager.begin(Identity::named("a"));
        let b = manager.begin(Identity::named("b"));

        reporter.report_object_access(&a, "x", AccessType::Read).unwrap();
        reporter.report_object_access(&b, "x", AccessType::Read).unwrap();

        assert!(manager.is_active(a.id()));
        assert!(manager.is_active(b.id()));
    }

    #[test]
    fn younger_reader_yields_to_older_writer() {
        let (manager, _coordinator, reporter) = setup();
        let older = manager.begin(Identity::named("a"));
        let younger = manager.begin(Identity::named("b"));

        reporter.report_object_access(&older, "x", AccessType::Write).unwrap();
        let err = reporter
            .report_object_access(&younger, "x", AccessType::Read)
            .unwrap_err();

        assert!(matches!(err, KernelError::TransactionAborted { retryable: true, .. }));
        assert!(manager.is_active(older.id()));
        assert!(!manager.is_active(younger.id()));
    }

    #[test]
    fn older_writer_aborts_younger_holder() {
        let (manager, _coordinator, reporter) = setup();
        let older = manager.begin(Identity::named("a"));
        let younger = manager.begin(Identity::named("b"));

        // The younger transaction touches the object first and is still the
        // one that loses the arbitration.
        reporter.report_object_access(&younger, "x", AccessType::Write).unwrap();
        reporter.report_object_access(&older, "x", AccessType::Write).unwrap();

        assert!(manager.is_active(older.id()));
        assert!(!manager.is_active(younger.id()));

        // The victim observes the abort on its next report.
        let err = reporter
            .report_object_access(&younger, "y", AccessType::Read)
            .unwrap_err();
        assert!(err.is_retry_eligible());
    }

    #[test]
    fn exactly_one_side_is_aborted() {
        let (manager, _coordinator, reporter) = setup();
        let a = manager.begin(Identity::named("a"));
        let b = manager.begin(Identity::named("b"));

        reporter.report_object_access(&a, "x", AccessType::Write).unwrap();
        let _ = reporter.report_object_access(&b, "x", AccessType::Write);

        let aborted = [a.id(), b.id()]
            .into_iter()
            .filter(|id| !manager.is_active(*id))
            .count();
        assert_eq!(aborted, 1);
    }

    #[test]
    fn same_transaction_may_upgrade_read_to_write() {
        let (manager, _coordinator, reporter) = setup();
        let txn = manager.begin(Identity::named("a"));
        reporter.report_object_access(&txn, "x", AccessType::Read).unwrap();
        reporter.report_object_access(&txn, "x", AccessType::Write).unwrap();
        assert!(manager.is_active(txn.id()));
    }

    #[test]
    fn finished_transactions_release_their_accesses() {
        let (manager, _coordinator, reporter) = setup();
        let a = manager.begin(Identity::named("a"));
        reporter.report_object_access(&a, "x", AccessType::Write).unwrap();
        manager.commit(&a).unwrap();

        let b = manager.begin(Identity::named("b"));
        reporter.report_object_access(&b, "x", AccessType::Write).unwrap();
        assert!(manager.is_active(b.id()));
    }

    #[test]
    fn report_on_unknown_transaction_fails() {
        let (manager, _coordinator, reporter) = setup();
        let txn = manager.begin(Identity::named("a"));
        manager.commit(&txn).unwrap();

        let err = reporter
            .report_object_access(&txn, "x", AccessType::Read)
            .unwrap_err();
        assert!(matches!(err, KernelError::TransactionState(_)));
    }

    #[test]
    fn first_description_sticks() {
        let (manager, coordinator, reporter) = setup();
        let listener = Arc::new(InMemoryProfileListener::new(16));
        coordinator.add_profile_listener(listener.clone());

        let txn = manager.begin(Identity::named("a"));
        reporter.set_object_description(&txn, "x", "first").unwrap();
        reporter.set_object_description(&txn, "x", "second").unwrap();
        reporter.report_object_access(&txn, "x", AccessType::Read).unwrap();

        let events = listener.accesses();
        assert_eq!(events.len(), 1);
        let desc = events[0].access.description().unwrap().to_string();
        assert_eq!(desc, "first");
    }

    #[test]
    fn described_report_attaches_inline() {
        let (manager, coordinator, reporter) = setup();
        let listener = Arc::new(InMemoryProfileListener::new(16));
        coordinator.add_profile_listener(listener.clone());

        let txn = manager.begin(Identity::named("a"));
        reporter
            .report_object_access_described(&txn, "x", AccessType::Write, "the x binding")
            .unwrap();

        let events = listener.accesses();
        assert_eq!(events[0].access.description().unwrap().to_string(), "the x binding");
        assert_eq!(events[0].access.source(), "data-service");
    }

    #[test]
    fn conflicts_are_reported_to_listeners() {
        let (manager, coordinator, reporter) = setup();
        let listener = Arc::new(InMemoryProfileListener::new(16));
        coordinator.add_profile_listener(listener.clone());

        let older = manager.begin(Identity::named("a"));
        let younger = manager.begin(Identity::named("b"));
        reporter.report_object_access(&older, "x", AccessType::Write).unwrap();
        let _ = reporter.report_object_access(&younger, "x", AccessType::Write);

        let conflicts = listener.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].winner, older.id());
        assert_eq!(conflicts[0].victim, younger.id());
    }

    #[test]
    fn panicking_listener_does_not_affect_reporting() {
        struct BadListener;
        impl ProfileListener for BadListener {
            fn object_access(&self, _event: &AccessEvent) {
                panic!("listener bug");
            }
        }

        let (manager, coordinator, reporter) = setup();
        coordinator.add_profile_listener(Arc::new(BadListener));

        let txn = manager.begin(Identity::named("a"));
        reporter.report_object_access(&txn, "x", AccessType::Read).unwrap();
        assert!(manager.is_active(txn.id()));
    }

    #[test]
    fn re_reporting_is_a_no_op() {
        let (manager, coordinator, reporter) = setup();
        let listener = Arc::new(InMemoryProfileListener::new(16));
        coordinator.add_profile_listener(listener.clone());

        let txn = manager.begin(Identity::named("a"));
        reporter.report_object_access(&txn, "x", AccessType::Read).unwrap();
        reporter.report_object_access(&txn, "x", AccessType::Read).unwrap();

        assert_eq!(listener.accesses().len(), 1);
    }
}

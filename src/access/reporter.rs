//! Per-source reporter façade over the access coordinator.

use std::fmt;
use std::sync::Arc;

use crate::access::coordinator::AccessCoordinator;
use crate::access::object::{AccessType, ObjectId};
use crate::core::error::KernelError;
use crate::core::transaction::TransactionHandle;

/// Entry point used by data-access code to report shared-object touches.
///
/// A reporter is bound to one source name at registration
/// ([`AccessCoordinator::register_source`]); every access it produces carries
/// that source, so profiling consumers can attribute conflicts to the
/// subsystem that caused them.
///
/// Access should be reported as early as possible: if resolving or retrieving
/// the object could fail or is expensive, report first, so the access is
/// always noted and a doomed transaction aborts before doing unneeded work.
#[derive(Clone)]
pub struct AccessReporter {
    coordinator: Arc<AccessCoordinator>,
    source: Arc<str>,
}

impl AccessReporter {
    pub(crate) fn new(coordinator: Arc<AccessCoordinator>, source: Arc<str>) -> Self {
        Self { coordinator, source }
    }

    /// The source name this reporter was registered under.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Report that `txn` accessed the identified shared object.
    ///
    /// # Errors
    ///
    /// [`KernelError::TransactionState`] if `txn` is not active or unknown to
    /// the coordinator; [`KernelError::TransactionAborted`] if the access
    /// lost a conflict (or the transaction was already aborted); the failure
    /// is retry-eligible so schedulers re-run the work.
    pub fn report_object_access(
        &self,
        txn: &TransactionHandle,
        object_id: impl Into<ObjectId>,
        access_type: AccessType,
    ) -> Result<(), KernelError> {
        self.coordinator
            .report(txn, &self.source, object_id.into(), access_type, None)
    }

    /// Report an access and attach a description in one call.
    ///
    /// The description only sticks if the object has none yet; see
    /// [`set_object_description`](Self::set_object_description).
    ///
    /// # Errors
    ///
    /// Same contract as [`report_object_access`](Self::report_object_access).
    pub fn report_object_access_described<D>(
        &self,
        txn: &TransactionHandle,
        object_id: impl Into<ObjectId>,
        access_type: AccessType,
        description: D,
    ) -> Result<(), KernelError>
    where
        D: fmt::Display + Send + Sync + 'static,
    {
        self.coordinator.report(
            txn,
            &self.source,
            object_id.into(),
            access_type,
            Some(Arc::new(description)),
        )
    }

    /// Associate a description with an object accessed (or about to be
    /// accessed) within `txn`, for profiling detail.
    ///
    /// May be called before the object's first report; the description is
    /// applied when the access is recorded. If a description already exists
    /// the call changes nothing. Descriptions are only formatted when a
    /// profile listener inspects them.
    ///
    /// # Errors
    ///
    /// [`KernelError::TransactionState`] or
    /// [`KernelError::TransactionAborted`] if `txn` is not active.
    pub fn set_object_description<D>(
        &self,
        txn: &TransactionHandle,
        object_id: impl Into<ObjectId>,
        description: D,
    ) -> Result<(), KernelError>
    where
        D: fmt::Display + Send + Sync + 'static,
    {
        self.coordinator
            .set_description(txn, object_id.into(), Arc::new(description))
    }
}

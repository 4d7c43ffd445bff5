//! Task reservations: guaranteed, cancellable claims on scheduler capacity.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::KernelError;
use crate::sched::record::TaskRecord;
use crate::sched::Dispatch;

const RESERVED: u8 = 0;
const USED: u8 = 1;
const CANCELLED: u8 = 2;

/// A guaranteed claim on future scheduling capacity.
///
/// Acquiring a reservation does not schedule the task: until
/// [`use_reservation`](Self::use_reservation) is called, the task never runs.
/// The capacity is held from the moment the reservation is granted, which is
/// what lets transactional callers make sure a follow-up task will be
/// accepted before they commit.
///
/// Exactly one of `use_reservation`/`cancel` can ever succeed; the losing
/// transition, and any repeat call, fails with
/// [`KernelError::InvalidState`]. Two threads racing the two calls resolve
/// through a single atomic compare-and-set.
pub struct TaskReservation {
    state: AtomicU8,
    record: Mutex<Option<TaskRecord>>,
    target: Arc<dyn Dispatch>,
}

impl TaskReservation {
    pub(crate) fn new(record: TaskRecord, target: Arc<dyn Dispatch>) -> Self {
        Self {
            state: AtomicU8::new(RESERVED),
            record: Mutex::new(Some(record)),
            target,
        }
    }

    /// Use the reservation, scheduling the associated task to run.
    ///
    /// If the task's intended start time has already passed it is submitted
    /// for immediate execution rather than discarded.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] if the reservation was already used or
    /// cancelled; the scheduler's submission error if the executor cannot
    /// take the task (the reserved capacity is returned in that case).
    pub fn use_reservation(&self) -> Result<(), KernelError> {
        self.transition(USED)?;
        let record = self.record.lock().take();
        let Some(record) = record else {
            return Err(KernelError::InvalidState(
                "reservation record already consumed".into(),
            ));
        };

        let owner = record.owner.clone();
        let charged = record.charged;
        match Arc::clone(&self.target).dispatch_record(record) {
            Ok(()) => Ok(()),
            Err(err) => {
                if charged {
                    self.target.shared().admission.release(&owner);
                }
                Err(err)
            }
        }
    }

    /// Cancel the reservation, releasing the reserved capacity at no cost to
    /// the owner.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] if the reservation was already used or
    /// cancelled.
    pub fn cancel(&self) -> Result<(), KernelError> {
        self.transition(CANCELLED)?;
        if let Some(record) = self.record.lock().take() {
            if record.charged {
                self.target.shared().admission.release(&record.owner);
            }
        }
        Ok(())
    }

    fn transition(&self, to: u8) -> Result<(), KernelError> {
        self.state
            .compare_exchange(RESERVED, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                let what = if actual == USED {
                    "already used"
                } else {
                    "already cancelled"
                };
                KernelError::InvalidState(format!("reservation {what}"))
            })
    }
}

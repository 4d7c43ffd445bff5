//! Admission control: total capacity plus per-owner quotas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::core::error::KernelError;
use crate::core::task::Identity;

/// Capacity accounting shared by a scheduler's submission paths.
///
/// The in-flight count covers queued, reserved, and running tasks. It is
/// tracked lock-free with a CAS loop; the per-owner quota map sits behind its
/// own mutex and is only consulted when a quota is configured.
pub(crate) struct AdmissionControl {
    max_ready: u32,
    /// 0 means unlimited.
    max_per_owner: u32,
    in_flight: AtomicU32,
    per_owner: Mutex<HashMap<Identity, u32>>,
}

impl AdmissionControl {
    pub(crate) fn new(max_ready: u32, max_per_owner: u32) -> Self {
        Self {
            max_ready,
            max_per_owner,
            in_flight: AtomicU32::new(0),
            per_owner: Mutex::new(HashMap::new()),
        }
    }

    /// Charge one unit of capacity to `owner`.
    pub(crate) fn admit(&self, owner: &Identity) -> Result<(), KernelError> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_ready {
                return Err(KernelError::TaskRejected(format!(
                    "scheduler at capacity ({current} tasks in flight)"
                )));
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.max_per_owner > 0 {
            let mut per_owner = self.per_owner.lock();
            let count = per_owner.get(owner).copied().unwrap_or(0);
            if count >= self.max_per_owner {
                drop(per_owner);
                self.in_flight.fetch_sub(1, Ordering::Release);
                return Err(KernelError::TaskRejected(format!(
                    "owner {owner} at quota ({count} tasks in flight)"
                )));
            }
            per_owner.insert(owner.clone(), count + 1);
        }

        Ok(())
    }

    /// Return one unit of capacity charged to `owner`.
    pub(crate) fn release(&self, owner: &Identity) {
        self.in_flight.fetch_sub(1, Ordering::Release);
        if self.max_per_owner > 0 {
            let mut per_owner = self.per_owner.lock();
            if let Some(count) = per_owner.get_mut(owner) {
                *count -= 1;
                if *count == 0 {
                    per_owner.remove(owner);
                }
            }
        }
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }
}

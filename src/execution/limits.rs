//! Memory Budget Module
//!
//! All running queries reserve memory for their intermediate results from one
//! shared [`AllocationBudget`]. When a reservation does not fit, the budget
//! asks its pressure callback (wired to the result cache) to free
//! `slack_factor` times the requested amount and retries once before failing.
//!
//! Reservations are RAII: dropping a [`MemoryReservation`] returns its bytes.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::QueryError;

/// Evict more than strictly needed so that back-to-back reservations do not
/// each trigger a round of eviction
pub const MAKE_ROOM_SLACK_FACTOR: usize = 2;

/// Called with the number of bytes to free. Returns the bytes actually freed.
pub type PressureCallback = Arc<dyn Fn(usize) -> usize + Send + Sync>;

pub struct AllocationBudget {
    limit: usize,
    used: AtomicUsize,
    slack_factor: usize,
    on_pressure: RwLock<Option<PressureCallback>>,
}

impl AllocationBudget {
    pub fn new(limit: usize) -> Self {
        Self::with_slack_factor(limit, MAKE_ROOM_SLACK_FACTOR)
    }

    pub fn with_slack_factor(limit: usize, slack_factor: usize) -> Self {
        AllocationBudget {
            limit,
            used: AtomicUsize::new(0),
            slack_factor: slack_factor.max(1),
            on_pressure: RwLock::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    pub fn set_pressure_callback(&self, callback: PressureCallback) {
        *self.on_pressure.write() = Some(callback);
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    fn try_reserve_once(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .is_ok()
    }

    /// Reserve `bytes`, evicting cached results once if necessary
    pub fn try_reserve(self: &Arc<Self>, bytes: usize) -> Result<MemoryReservation, QueryError> {
        if !self.try_reserve_once(bytes) {
            let callback = self.on_pressure.read().clone();
            if let Some(callback) = callback {
                let wanted = bytes.saturating_mul(self.slack_factor);
                let freed = callback(wanted);
                tracing::debug!(requested = bytes, wanted, freed, "memory_pressure_eviction");
            }
            if !self.try_reserve_once(bytes) {
                let available = self.available();
                tracing::warn!(requested = bytes, available, "memory_limit_exceeded");
                return Err(QueryError::MemoryLimitExceeded {
                    requested: bytes,
                    available,
                });
            }
        }
        Ok(MemoryReservation {
            budget: Arc::clone(self),
            bytes,
        })
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl fmt::Debug for AllocationBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationBudget")
            .field("limit", &self.limit)
            .field("used", &self.used())
            .field("slack_factor", &self.slack_factor)
            .finish_non_exhaustive()
    }
}

/// Bytes held from an [`AllocationBudget`] until dropped
pub struct MemoryReservation {
    budget: Arc<AllocationBudget>,
    bytes: usize,
}

impl MemoryReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reserve_and_release() {
        let budget = Arc::new(AllocationBudget::new(100));
        let a = budget.try_reserve(60).unwrap();
        assert_eq!(budget.used(), 60);
        assert!(budget.try_reserve(60).is_err());
        drop(a);
        assert_eq!(budget.used(), 0);
        assert!(budget.try_reserve(100).is_ok());
    }

    #[test]
    fn test_pressure_callback_requested_with_slack() {
        let budget = Arc::new(AllocationBudget::new(100));
        let held = budget.try_reserve(90).unwrap();
        let requested = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&requested);
        budget.set_pressure_callback(Arc::new(move |bytes| {
            seen.store(bytes, Ordering::SeqCst);
            0
        }));
        let err = budget.try_reserve(20).unwrap_err();
        assert_eq!(requested.load(Ordering::SeqCst), 20 * MAKE_ROOM_SLACK_FACTOR);
        assert!(matches!(
            err,
            QueryError::MemoryLimitExceeded {
                requested: 20,
                available: 10
            }
        ));
        drop(held);
    }

    #[test]
    fn test_retry_succeeds_after_room_was_made() {
        let budget = Arc::new(AllocationBudget::new(100));
        // Stand-in for a cached result that the callback can evict
        let evictable = Arc::new(parking_lot::Mutex::new(Some(budget.try_reserve(80).unwrap())));
        let slot = Arc::clone(&evictable);
        budget.set_pressure_callback(Arc::new(move |_| {
            slot.lock().take().map_or(0, |r| r.bytes())
        }));
        let reservation = budget.try_reserve(50).unwrap();
        assert_eq!(reservation.bytes(), 50);
        assert!(evictable.lock().is_none());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let budget = Arc::new(AllocationBudget::unlimited());
        let _a = budget.try_reserve(usize::MAX - 1).unwrap();
        assert!(budget.try_reserve(10).is_err());
    }
}

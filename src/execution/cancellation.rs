//! Cooperative query cancellation
//!
//! A [`CancellationHandle`] is shared between the request that owns a query,
//! every node of its execution tree and the timer racing it. Long-running
//! operations poll it with [`CancellationHandle::throw_if_cancelled`]; nothing
//! is ever interrupted forcibly.
//!
//! ## Watchdog
//!
//! [`CancellationHandle::start_watch_dog`] starts a background thread that
//! ticks every [`DESIRED_CANCELLATION_CHECK_INTERVAL`]. The first tick after a
//! poll opens a check window, a second tick without an intervening poll marks
//! the window as missed. Missed windows are logged on the next poll and
//! counted, they never fail the query.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;

/// How often a running operation is expected to poll its handle
pub const DESIRED_CANCELLATION_CHECK_INTERVAL: Duration = Duration::from_millis(50);

const NOT_CANCELLED: u8 = 0;
const MANUAL: u8 = 1;
const TIMEOUT: u8 = 2;

const CHECKED: u8 = 0;
const WAITING_FOR_CHECK: u8 = 1;
const CHECK_WINDOW_MISSED: u8 = 2;

/// Why a query was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Cancelled by a client disconnect or an administrator
    Manual,
    /// The query's time limit expired
    Timeout,
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancellationReason::Manual => write!(f, "Query was cancelled"),
            CancellationReason::Timeout => write!(f, "Query timed out"),
        }
    }
}

/// Raised by [`CancellationHandle::throw_if_cancelled`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} while {detail}")]
pub struct CancellationError {
    pub reason: CancellationReason,
    /// What the operation was doing when it noticed
    pub detail: String,
}

pub struct CancellationHandle {
    state: AtomicU8,
    watch_dog_state: AtomicU8,
    watch_dog_running: AtomicBool,
    missed_windows: AtomicU64,
    /// Nanoseconds after `created` of the most recent poll
    last_check_nanos: AtomicU64,
    created: Instant,
}

impl CancellationHandle {
    pub fn new() -> Self {
        CancellationHandle {
            state: AtomicU8::new(NOT_CANCELLED),
            watch_dog_state: AtomicU8::new(CHECKED),
            watch_dog_running: AtomicBool::new(false),
            missed_windows: AtomicU64::new(0),
            last_check_nanos: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Cancel with `reason`. Only the first call has an effect.
    pub fn cancel(&self, reason: CancellationReason) {
        let new_state = match reason {
            CancellationReason::Manual => MANUAL,
            CancellationReason::Timeout => TIMEOUT,
        };
        if self
            .state
            .compare_exchange(NOT_CANCELLED, new_state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(reason = ?reason, "query_cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) != NOT_CANCELLED
    }

    pub fn reason(&self) -> Option<CancellationReason> {
        match self.state.load(Ordering::Acquire) {
            MANUAL => Some(CancellationReason::Manual),
            TIMEOUT => Some(CancellationReason::Timeout),
            _ => None,
        }
    }

    /// Safe point for long-running operations.
    ///
    /// Returns the terminal reason every time once the handle is cancelled.
    /// `detail` names what the caller was doing and ends up in the error.
    pub fn throw_if_cancelled(&self, detail: &str) -> Result<(), CancellationError> {
        if let Some(reason) = self.reason() {
            return Err(CancellationError {
                reason,
                detail: detail.to_string(),
            });
        }
        if self.watch_dog_running.load(Ordering::Relaxed) {
            self.poll_watch_dog(detail);
        }
        Ok(())
    }

    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn poll_watch_dog(&self, detail: &str) {
        let previous = self.watch_dog_state.swap(CHECKED, Ordering::AcqRel);
        let now = self.elapsed_nanos();
        let last = self.last_check_nanos.swap(now, Ordering::AcqRel);
        if previous == CHECK_WINDOW_MISSED {
            let since_last_check = Duration::from_nanos(now.saturating_sub(last));
            tracing::warn!(
                detail,
                since_last_check_ms = since_last_check.as_millis() as u64,
                desired_ms = DESIRED_CANCELLATION_CHECK_INTERVAL.as_millis() as u64,
                "cancellation_check_window_missed"
            );
        }
    }

    /// Start the watchdog thread. Calling this twice is a no-op.
    ///
    /// The thread only holds a weak reference and exits once the handle is
    /// dropped or cancelled.
    pub fn start_watch_dog(self: &Arc<Self>) {
        if self.watch_dog_running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reset_watch_dog_state();
        let weak: Weak<Self> = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("cancellation-watchdog".to_string())
            .spawn(move || loop {
                std::thread::sleep(DESIRED_CANCELLATION_CHECK_INTERVAL);
                let Some(handle) = weak.upgrade() else {
                    break;
                };
                if handle.is_cancelled() {
                    break;
                }
                handle.watch_dog_tick();
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "watchdog_spawn_failed");
            self.watch_dog_running.store(false, Ordering::Release);
        }
    }

    fn watch_dog_tick(&self) {
        let missed = self
            .watch_dog_state
            .compare_exchange(
                WAITING_FOR_CHECK,
                CHECK_WINDOW_MISSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if missed {
            self.missed_windows.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self.watch_dog_state.compare_exchange(
                CHECKED,
                WAITING_FOR_CHECK,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Close the current check window, e.g. before a phase that does not
    /// poll on purpose.
    pub fn reset_watch_dog_state(&self) {
        self.watch_dog_state.store(CHECKED, Ordering::Release);
        self.last_check_nanos
            .store(self.elapsed_nanos(), Ordering::Release);
    }

    /// Whether any check window has been missed since the watchdog started
    pub fn check_window_missed(&self) -> bool {
        self.missed_windows.load(Ordering::Relaxed) > 0
    }

    pub fn missed_check_windows(&self) -> u64 {
        self.missed_windows.load(Ordering::Relaxed)
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("reason", &self.reason())
            .field("missed_windows", &self.missed_check_windows())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_not_cancelled_by_default() {
        let handle = CancellationHandle::new();
        assert!(!handle.is_cancelled());
        assert!(handle.reason().is_none());
        assert!(handle.throw_if_cancelled("scan").is_ok());
    }

    #[test]
    fn test_first_reason_wins() {
        let handle = CancellationHandle::new();
        handle.cancel(CancellationReason::Timeout);
        handle.cancel(CancellationReason::Manual);
        handle.cancel(CancellationReason::Manual);
        assert_eq!(handle.reason(), Some(CancellationReason::Timeout));

        for _ in 0..3 {
            let err = handle.throw_if_cancelled("join").unwrap_err();
            assert_eq!(err.reason, CancellationReason::Timeout);
            assert_eq!(err.detail, "join");
        }
    }

    #[test]
    fn test_concurrent_cancel_keeps_a_single_reason() {
        let handle = Arc::new(CancellationHandle::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || {
                    let reason = if i % 2 == 0 {
                        CancellationReason::Manual
                    } else {
                        CancellationReason::Timeout
                    };
                    handle.cancel(reason);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let first = handle.reason().unwrap();
        for _ in 0..10 {
            assert_eq!(handle.throw_if_cancelled("x").unwrap_err().reason, first);
        }
    }

    #[test]
    fn test_error_message_mentions_reason_and_detail() {
        let handle = CancellationHandle::new();
        handle.cancel(CancellationReason::Timeout);
        let err = handle.throw_if_cancelled("computing IndexScan").unwrap_err();
        assert_eq!(err.to_string(), "Query timed out while computing IndexScan");
    }

    #[test]
    fn test_watch_dog_detects_missing_polls() {
        let handle = Arc::new(CancellationHandle::new());
        handle.start_watch_dog();
        // Several intervals without a single poll
        thread::sleep(DESIRED_CANCELLATION_CHECK_INTERVAL * 5);
        assert!(handle.check_window_missed());
        // Polling is still fine, a missed window is only diagnostic
        assert!(handle.throw_if_cancelled("late poll").is_ok());
    }

    #[test]
    fn test_watch_dog_quiet_while_polled() {
        let handle = Arc::new(CancellationHandle::new());
        handle.start_watch_dog();
        let deadline = Instant::now() + DESIRED_CANCELLATION_CHECK_INTERVAL * 4;
        while Instant::now() < deadline {
            handle.throw_if_cancelled("busy loop").unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!handle.check_window_missed());
    }

    #[test]
    fn test_reset_closes_window() {
        let handle = CancellationHandle::new();
        handle.watch_dog_tick();
        handle.reset_watch_dog_state();
        handle.watch_dog_tick();
        assert!(!handle.check_window_missed());
        handle.watch_dog_tick();
        assert!(handle.check_window_missed());
    }

    #[test]
    fn test_watch_dog_thread_does_not_keep_handle_alive() {
        let handle = Arc::new(CancellationHandle::new());
        handle.start_watch_dog();
        let weak = Arc::downgrade(&handle);
        drop(handle);
        thread::sleep(DESIRED_CANCELLATION_CHECK_INTERVAL * 3);
        assert!(weak.upgrade().is_none());
    }
}

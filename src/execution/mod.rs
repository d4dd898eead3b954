//! Query Execution Module
//!
//! The shared machinery every query runs on:
//! - cooperative cancellation with a polling watchdog
//! - the result cache with at-most-one computation per key
//! - the memory budget for intermediate results
//! - the bounded worker pool

mod cache;
mod cancellation;
mod limits;
mod worker_pool;

pub use cache::{CacheLimits, CacheResult, CacheStats, CacheStatus, CacheableValue, ResultCache};
pub use cancellation::{
    CancellationError, CancellationHandle, CancellationReason, DESIRED_CANCELLATION_CHECK_INTERVAL,
};
pub use limits::{AllocationBudget, MemoryReservation, PressureCallback, MAKE_ROOM_SLACK_FACTOR};
pub use worker_pool::WorkerPool;

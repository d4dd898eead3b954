//! Result Cache Module
//!
//! Memoizes sub-results of query execution by their cache key.
//!
//! ## Design
//!
//! - At most one computation per key at a time. A caller that finds a key in
//!   progress blocks on that computation and receives its result or error.
//! - Pinned entries are exempt from size and count based eviction.
//! - Unpinned entries are evicted least recently used first.
//! - The bounds can be changed while the server runs; shrinking a bound evicts
//!   immediately.
//!
//! The map lock is never held while a computation runs, so `compute` may
//! itself call back into the cache for its children.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::cancellation::{CancellationHandle, DESIRED_CANCELLATION_CHECK_INTERVAL};
use crate::error::QueryError;

/// A value that can live in the [`ResultCache`]
pub trait CacheableValue: Clone + Send + Sync + 'static {
    /// Memory accounted to this value while it is cached
    fn size_in_bytes(&self) -> usize;
}

/// How a [`ResultCache::get_or_compute`] call obtained its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// This caller ran the computation
    Computed,
    /// Hit on an entry that was already pinned
    CachedPinned,
    /// Hit on an unpinned entry
    CachedNotPinned,
    /// Waited for a computation started by another caller
    Joined,
}

impl CacheStatus {
    pub fn was_cached(self) -> bool {
        !matches!(self, CacheStatus::Computed)
    }
}

#[derive(Debug, Clone)]
pub struct CacheResult<V> {
    pub value: V,
    pub status: CacheStatus,
}

/// Bounds applied to unpinned entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_num_entries: usize,
    /// Total bytes of unpinned entries
    pub max_size: usize,
    /// Results larger than this are handed out but never retained
    pub max_size_single_entry: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheLimits {
            max_num_entries: 1000,
            max_size: 30 << 30,
            max_size_single_entry: 5 << 30,
        }
    }
}

/// Snapshot of the cache's occupancy and counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheStats {
    pub num_non_pinned_entries: usize,
    pub num_pinned_entries: usize,
    pub non_pinned_size: usize,
    pub pinned_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups answered without computing (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry<V> {
    value: V,
    size: usize,
    pinned: bool,
    last_access: u64,
}

struct InFlight<V> {
    result: Mutex<Option<Result<V, QueryError>>>,
    ready: Condvar,
    /// Set when the computing caller or any joiner asked for a pinned result
    pin: AtomicBool,
}

impl<V: CacheableValue> InFlight<V> {
    fn new(pin: bool) -> Self {
        InFlight {
            result: Mutex::new(None),
            ready: Condvar::new(),
            pin: AtomicBool::new(pin),
        }
    }

    fn publish(&self, outcome: Result<V, QueryError>) {
        *self.result.lock() = Some(outcome);
        self.ready.notify_all();
    }
}

enum Slot<V> {
    Ready(CacheEntry<V>),
    InProgress(Arc<InFlight<V>>),
}

struct Inner<V> {
    entries: HashMap<String, Slot<V>>,
    limits: CacheLimits,
    clock: u64,
    pinned_size: usize,
    non_pinned_size: usize,
    num_pinned: usize,
    num_non_pinned: usize,
}

impl<V> Inner<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn account_insert(&mut self, size: usize, pinned: bool) {
        if pinned {
            self.pinned_size += size;
            self.num_pinned += 1;
        } else {
            self.non_pinned_size += size;
            self.num_non_pinned += 1;
        }
    }

    fn account_remove(&mut self, size: usize, pinned: bool) {
        if pinned {
            self.pinned_size -= size;
            self.num_pinned -= 1;
        } else {
            self.non_pinned_size -= size;
            self.num_non_pinned -= 1;
        }
    }

    /// Unpinned ready entries, least recently used first
    fn eviction_candidates(&self) -> Vec<(String, u64, usize)> {
        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(entry) if !entry.pinned => {
                    Some((key.clone(), entry.last_access, entry.size))
                }
                _ => None,
            })
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);
        candidates
    }

    /// Remove an unpinned ready entry, returning its size
    fn evict(&mut self, key: &str) -> usize {
        match self.entries.remove(key) {
            Some(Slot::Ready(entry)) => {
                self.account_remove(entry.size, entry.pinned);
                entry.size
            }
            Some(other) => {
                self.entries.insert(key.to_string(), other);
                0
            }
            None => 0,
        }
    }

    /// Apply the bounds to unpinned entries. Returns the number evicted.
    fn evict_to_fit(&mut self) -> usize {
        let limits = self.limits;
        let mut evicted = 0;
        for (key, _, size) in self.eviction_candidates() {
            let over_count = self.num_non_pinned > limits.max_num_entries;
            let over_size = self.non_pinned_size > limits.max_size;
            let too_large = size > limits.max_size_single_entry;
            if !(over_count || over_size || too_large) {
                continue;
            }
            self.evict(&key);
            evicted += 1;
        }
        evicted
    }
}

/// Thread-safe memo table of sub-results.
///
/// Share it behind an `Arc`; all methods take `&self`.
pub struct ResultCache<V> {
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    evictions: AtomicU64,
}

impl<V: CacheableValue> ResultCache<V> {
    pub fn new(limits: CacheLimits) -> Self {
        ResultCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                limits,
                clock: 0,
                pinned_size: 0,
                non_pinned_size: 0,
                num_pinned: 0,
                num_non_pinned: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up `key`, join a running computation of it, or run `compute`.
    ///
    /// With `pin`, the entry is retained (or becomes) pinned.
    pub fn get_or_compute<F>(
        &self,
        key: &str,
        compute: F,
        pin: bool,
    ) -> Result<CacheResult<V>, QueryError>
    where
        F: FnOnce() -> Result<V, QueryError>,
    {
        self.get_or_compute_impl(key, compute, pin, None)
    }

    /// Like [`ResultCache::get_or_compute`], but a caller that joins a
    /// computation of another query keeps polling `handle` while it waits.
    pub fn get_or_compute_cancellable<F>(
        &self,
        key: &str,
        compute: F,
        pin: bool,
        handle: &CancellationHandle,
    ) -> Result<CacheResult<V>, QueryError>
    where
        F: FnOnce() -> Result<V, QueryError>,
    {
        self.get_or_compute_impl(key, compute, pin, Some(handle))
    }

    fn get_or_compute_impl<F>(
        &self,
        key: &str,
        compute: F,
        pin: bool,
        handle: Option<&CancellationHandle>,
    ) -> Result<CacheResult<V>, QueryError>
    where
        F: FnOnce() -> Result<V, QueryError>,
    {
        let mut inner = self.inner.lock();
        let now = inner.tick();
        let mut newly_pinned = None;
        match inner.entries.get_mut(key) {
            Some(Slot::Ready(entry)) => {
                entry.last_access = now;
                let status = if entry.pinned {
                    CacheStatus::CachedPinned
                } else {
                    CacheStatus::CachedNotPinned
                };
                if pin && !entry.pinned {
                    entry.pinned = true;
                    newly_pinned = Some(entry.size);
                }
                let value = entry.value.clone();
                if let Some(size) = newly_pinned {
                    inner.account_remove(size, false);
                    inner.account_insert(size, true);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheResult { value, status });
            }
            Some(Slot::InProgress(flight)) => {
                let flight = Arc::clone(flight);
                drop(inner);
                if pin {
                    flight.pin.store(true, Ordering::Release);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(cache_key = key, "cache_join_in_progress");
                let value = Self::wait_for(&flight, handle)?;
                return Ok(CacheResult {
                    value,
                    status: CacheStatus::Joined,
                });
            }
            None => {}
        }

        let flight = Arc::new(InFlight::new(pin));
        inner
            .entries
            .insert(key.to_string(), Slot::InProgress(Arc::clone(&flight)));
        drop(inner);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.computations.fetch_add(1, Ordering::Relaxed);

        let mut guard = PublishOnDrop {
            cache: self,
            key,
            flight: &flight,
            armed: true,
        };
        let outcome = compute();
        guard.armed = false;
        self.finish(key, &flight, outcome.clone());
        outcome.map(|value| CacheResult {
            value,
            status: CacheStatus::Computed,
        })
    }

    fn wait_for(
        flight: &InFlight<V>,
        handle: Option<&CancellationHandle>,
    ) -> Result<V, QueryError> {
        let mut result = flight.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            match handle {
                Some(handle) => {
                    flight
                        .ready
                        .wait_for(&mut result, DESIRED_CANCELLATION_CHECK_INTERVAL);
                    handle.throw_if_cancelled("waiting for a result computed by another query")?;
                }
                None => flight.ready.wait(&mut result),
            }
        }
    }

    /// Store the outcome of a computation and wake everyone who joined it
    fn finish(&self, key: &str, flight: &Arc<InFlight<V>>, outcome: Result<V, QueryError>) {
        let mut inner = self.inner.lock();
        let ours = matches!(
            inner.entries.get(key),
            Some(Slot::InProgress(current)) if Arc::ptr_eq(current, flight)
        );
        if ours {
            inner.entries.remove(key);
            if let Ok(value) = &outcome {
                let size = value.size_in_bytes();
                let pinned = flight.pin.load(Ordering::Acquire);
                if size <= inner.limits.max_size_single_entry {
                    let last_access = inner.tick();
                    inner.entries.insert(
                        key.to_string(),
                        Slot::Ready(CacheEntry {
                            value: value.clone(),
                            size,
                            pinned,
                            last_access,
                        }),
                    );
                    inner.account_insert(size, pinned);
                    let evicted = inner.evict_to_fit();
                    self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                } else {
                    tracing::debug!(
                        cache_key = key,
                        size,
                        max_size_single_entry = inner.limits.max_size_single_entry,
                        "cache_entry_too_large"
                    );
                }
            }
        } else {
            tracing::error!(cache_key = key, "cache_in_progress_marker_replaced");
            debug_assert!(false, "in-progress marker for {key} was replaced");
        }
        drop(inner);
        flight.publish(outcome);
    }

    /// Remove every ready, unpinned entry
    pub fn clear_unpinned_only(&self) {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .eviction_candidates()
            .into_iter()
            .map(|(key, _, _)| key)
            .collect();
        for key in &keys {
            inner.evict(key);
        }
        drop(inner);
        tracing::info!(removed = keys.len(), "cache_cleared_unpinned");
    }

    /// Remove every ready entry including pinned ones.
    /// Computations in progress are left alone.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, slot| matches!(slot, Slot::InProgress(_)));
        inner.pinned_size = 0;
        inner.non_pinned_size = 0;
        inner.num_pinned = 0;
        inner.num_non_pinned = 0;
        let removed = before - inner.entries.len();
        drop(inner);
        tracing::info!(removed, "cache_cleared_all");
    }

    /// Make a pinned entry evictable again. Returns whether `key` was pinned.
    pub fn unpin(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let size = match inner.entries.get_mut(key) {
            Some(Slot::Ready(entry)) if entry.pinned => {
                entry.pinned = false;
                entry.size
            }
            _ => return false,
        };
        inner.account_remove(size, true);
        inner.account_insert(size, false);
        let evicted = inner.evict_to_fit();
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        true
    }

    /// Evict unpinned entries, least recently used first, until
    /// `target_bytes` were freed or nothing evictable is left.
    /// Returns the number of bytes freed.
    pub fn make_room_as_much_as_possible(&self, target_bytes: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        let mut evicted = 0u64;
        for (key, _, _) in inner.eviction_candidates() {
            if freed >= target_bytes {
                break;
            }
            freed += inner.evict(&key);
            evicted += 1;
        }
        drop(inner);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        tracing::debug!(target_bytes, freed, evicted, "cache_make_room");
        freed
    }

    fn update_limits(&self, update: impl FnOnce(&mut CacheLimits)) {
        let mut inner = self.inner.lock();
        update(&mut inner.limits);
        let evicted = inner.evict_to_fit();
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    pub fn set_max_num_entries(&self, max_num_entries: usize) {
        self.update_limits(|limits| limits.max_num_entries = max_num_entries);
    }

    pub fn set_max_size(&self, max_size: usize) {
        self.update_limits(|limits| limits.max_size = max_size);
    }

    pub fn set_max_size_single_entry(&self, max_size_single_entry: usize) {
        self.update_limits(|limits| limits.max_size_single_entry = max_size_single_entry);
    }

    pub fn limits(&self) -> CacheLimits {
        self.inner.lock().limits
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            num_non_pinned_entries: inner.num_non_pinned,
            num_pinned_entries: inner.num_pinned,
            non_pinned_size: inner.non_pinned_size,
            pinned_size: inner.pinned_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Whether `key` holds a ready value
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.inner.lock().entries.get(key), Some(Slot::Ready(_)))
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        matches!(
            self.inner.lock().entries.get(key),
            Some(Slot::Ready(entry)) if entry.pinned
        )
    }

    pub fn num_in_progress(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|slot| matches!(slot, Slot::InProgress(_)))
            .count()
    }
}

impl<V: CacheableValue> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(CacheLimits::default())
    }
}

/// Publishes an internal error if `compute` unwinds, so joiners never hang
/// and the marker does not leak.
struct PublishOnDrop<'a, V: CacheableValue> {
    cache: &'a ResultCache<V>,
    key: &'a str,
    flight: &'a Arc<InFlight<V>>,
    armed: bool,
}

impl<V: CacheableValue> Drop for PublishOnDrop<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(cache_key = self.key, "cache_computation_panicked");
            self.cache.finish(
                self.key,
                self.flight,
                Err(QueryError::internal(format!(
                    "The computation of {} panicked",
                    self.key
                ))),
            );
        }
    }
}

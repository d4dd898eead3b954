//! Registry of in-flight queries
//!
//! Every running query holds an [`OwningQueryId`], a lease on its id string.
//! The lease carries the query's cancellation handle and removes the registry
//! entry when dropped, on success, error and cancellation alike. A string can
//! be leased again once the previous lease is gone, yielding a new identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::execution::{CancellationHandle, CancellationReason};

/// Identifier of one query, chosen by the client or generated
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        QueryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct RegistryEntry {
    generation: u64,
    handle: Arc<CancellationHandle>,
    query: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

type EntryMap = HashMap<QueryId, RegistryEntry>;

/// Point-in-time view of one active query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActiveQuery {
    pub query_id: QueryId,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Process-wide map from query id to cancellation handle and metadata.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct QueryRegistry {
    entries: Arc<Mutex<EntryMap>>,
    next_generation: Arc<AtomicU64>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a freshly generated id
    pub fn unique_id(&self, query: &str) -> OwningQueryId {
        loop {
            let candidate = QueryId(uuid::Uuid::new_v4().to_string());
            if let Some(lease) = self.try_register(candidate, query) {
                return lease;
            }
        }
    }

    /// Lease the client-chosen `token`, failing while another lease holds it
    pub fn unique_id_from_string(
        &self,
        token: &str,
        query: &str,
    ) -> Result<OwningQueryId, QueryError> {
        self.try_register(QueryId(token.to_string()), query)
            .ok_or_else(|| QueryError::QueryIdInUse(token.to_string()))
    }

    fn try_register(&self, id: QueryId, query: &str) -> Option<OwningQueryId> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(CancellationHandle::new());
        entries.insert(
            id.clone(),
            RegistryEntry {
                generation,
                handle: Arc::clone(&handle),
                query: query.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );
        drop(entries);
        tracing::debug!(query_id = %id, generation, "query_id_registered");
        Some(OwningQueryId {
            id,
            generation,
            handle,
            entries: Arc::clone(&self.entries),
        })
    }

    /// Cancellation handle of an active query, `None` if no lease holds `id`
    pub fn get_cancellation_handle(&self, id: &QueryId) -> Option<Arc<CancellationHandle>> {
        self.entries
            .lock()
            .get(id)
            .map(|entry| Arc::clone(&entry.handle))
    }

    /// Cancel an active query. Returns `false` if `id` is not active.
    pub fn cancel(&self, id: &QueryId, reason: CancellationReason) -> bool {
        match self.get_cancellation_handle(id) {
            Some(handle) => {
                handle.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: &QueryId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn num_active(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot of all active queries, oldest first. Taken under the lock,
    /// iterated without it.
    pub fn get_active_queries(&self) -> impl Iterator<Item = ActiveQuery> {
        let mut snapshot: Vec<ActiveQuery> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| ActiveQuery {
                query_id: id.clone(),
                query: entry.query.clone(),
                started_at: entry.started_at,
                elapsed_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect();
        snapshot.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshot.into_iter()
    }
}

/// Lease on a query id. Dropping it deregisters the id.
pub struct OwningQueryId {
    id: QueryId,
    generation: u64,
    handle: Arc<CancellationHandle>,
    entries: Arc<Mutex<EntryMap>>,
}

impl OwningQueryId {
    pub fn to_query_id(&self) -> &QueryId {
        &self.id
    }

    /// Distinguishes two leases of the same id string
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancellation_handle(&self) -> &Arc<CancellationHandle> {
        &self.handle
    }
}

impl fmt::Debug for OwningQueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwningQueryId")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Drop for OwningQueryId {
    fn drop(&mut self) {
        let mut entries = self.entries.lock();
        let ours = entries
            .get(&self.id)
            .is_some_and(|entry| entry.generation == self.generation);
        if ours {
            entries.remove(&self.id);
        }
        drop(entries);
        tracing::debug!(query_id = %self.id, generation = self.generation, "query_id_released");
    }
}

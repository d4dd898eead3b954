//! Per-query broadcast of progress updates

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{HubCommand, HubError};
use crate::registry::QueryId;

#[derive(Default)]
struct History {
    data: Vec<Arc<String>>,
    finished: bool,
}

/// Connects the one producer of a query's updates to any number of
/// observers. Every observer sees the full history from the beginning.
pub struct QueryToSocketDistributor {
    id: QueryId,
    generation: u64,
    history: Mutex<History>,
    new_data: Notify,
    has_sender: AtomicBool,
    hub: mpsc::UnboundedSender<HubCommand>,
}

impl QueryToSocketDistributor {
    pub(super) fn new(
        id: QueryId,
        generation: u64,
        hub: mpsc::UnboundedSender<HubCommand>,
    ) -> Self {
        QueryToSocketDistributor {
            id,
            generation,
            history: Mutex::new(History::default()),
            new_data: Notify::new(),
            has_sender: AtomicBool::new(false),
            hub,
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.id
    }

    /// Distinguishes distributors created for the same id at different times
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Claim the producer role. Only called on the hub's task.
    pub(super) fn claim_sender(&self) -> bool {
        !self.has_sender.swap(true, Ordering::AcqRel)
    }

    pub fn has_sender(&self) -> bool {
        self.has_sender.load(Ordering::Acquire)
    }

    /// Append `payload` and wake every waiting observer
    pub fn add_query_status_update(&self, payload: String) -> Result<(), HubError> {
        let mut history = self.history.lock();
        if history.finished {
            return Err(HubError::AlreadyFinished(self.id.clone()));
        }
        history.data.push(Arc::new(payload));
        drop(history);
        self.new_data.notify_waiters();
        Ok(())
    }

    /// No more updates will follow. Observers drain the history and stop.
    ///
    /// Also unlinks this generation from the hub, so the next producer for
    /// the same id starts a fresh one.
    pub fn signal_end(&self) {
        let mut history = self.history.lock();
        if history.finished {
            return;
        }
        history.finished = true;
        drop(history);
        self.new_data.notify_waiters();
        let _ = self.hub.send(HubCommand::EndSignalled {
            id: self.id.clone(),
            generation: self.generation,
        });
    }

    pub fn is_finished(&self) -> bool {
        self.history.lock().finished
    }

    pub fn len(&self) -> usize {
        self.history.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Update number `index`, waiting for it if it was not sent yet.
    /// `None` once the producer has finished and `index` is past the end.
    pub async fn wait_for_next_data_piece(&self, index: usize) -> Option<Arc<String>> {
        loop {
            let notified = self.new_data.notified();
            tokio::pin!(notified);
            // Register before looking, so an update in between is not missed
            notified.as_mut().enable();
            {
                let history = self.history.lock();
                if let Some(piece) = history.data.get(index) {
                    return Some(Arc::clone(piece));
                }
                if history.finished {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl fmt::Debug for QueryToSocketDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryToSocketDistributor")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("has_sender", &self.has_sender())
            .finish_non_exhaustive()
    }
}

impl Drop for QueryToSocketDistributor {
    fn drop(&mut self) {
        // Cleanup runs on the hub's task, never inline
        let _ = self.hub.send(HubCommand::Cleanup {
            id: self.id.clone(),
            generation: self.generation,
        });
    }
}

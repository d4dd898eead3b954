//! Query Hub
//!
//! Publish/subscribe of live query progress. For every query id there is at
//! most one [`QueryToSocketDistributor`] per generation, shared by the
//! producing query and all observers.
//!
//! ## Design
//!
//! The hub only keeps weak references. All creation, lookup and cleanup run
//! as commands on a single actor task, so concurrent acquisitions and drops
//! for the same id are totally ordered. A distributor dropped on any thread
//! posts its cleanup back to that task.

mod distributor;
mod message_sender;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};

use crate::error::QueryError;
use crate::registry::QueryId;

pub use distributor::QueryToSocketDistributor;
pub use message_sender::MessageSender;

/// Hub error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// A producer is already attached to this id's current generation
    #[error("A sender for query id '{0}' already exists")]
    SenderAlreadyExists(QueryId),

    /// The producer already signalled the end of its updates
    #[error("Query id '{0}' already signalled the end of its updates")]
    AlreadyFinished(QueryId),

    /// The hub's task is gone (runtime shutting down)
    #[error("The query hub is no longer running")]
    Stopped,
}

impl From<HubError> for QueryError {
    fn from(e: HubError) -> Self {
        QueryError::internal(e.to_string())
    }
}

pub(crate) enum HubCommand {
    Acquire {
        id: QueryId,
        for_sending: bool,
        respond_to: oneshot::Sender<Result<Arc<QueryToSocketDistributor>, HubError>>,
    },
    Cleanup {
        id: QueryId,
        generation: u64,
    },
    EndSignalled {
        id: QueryId,
        generation: u64,
    },
    #[cfg(test)]
    Len {
        respond_to: oneshot::Sender<usize>,
    },
}

struct HubEntry {
    distributor: Weak<QueryToSocketDistributor>,
    generation: u64,
}

/// Handle to the hub's actor task. Cheap to clone.
#[derive(Clone)]
pub struct QueryHub {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl QueryHub {
    /// Spawn the hub's task on the current tokio runtime
    pub fn new() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let actor = HubActor {
            distributors: HashMap::new(),
            next_generation: 0,
            commands: commands.downgrade(),
        };
        tokio::spawn(actor.run(receiver));
        QueryHub { commands }
    }

    async fn acquire(
        &self,
        id: &QueryId,
        for_sending: bool,
    ) -> Result<Arc<QueryToSocketDistributor>, HubError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Acquire {
                id: id.clone(),
                for_sending,
                respond_to,
            })
            .map_err(|_| HubError::Stopped)?;
        response.await.map_err(|_| HubError::Stopped)?
    }

    /// Distributor for the producer of `id`.
    /// Fails if the current generation already has a producer.
    pub async fn create_or_acquire_distributor_for_sending(
        &self,
        id: &QueryId,
    ) -> Result<Arc<QueryToSocketDistributor>, HubError> {
        self.acquire(id, true).await
    }

    /// Distributor for an observer of `id`, created if nobody produced yet
    pub async fn create_or_acquire_distributor_for_receiving(
        &self,
        id: &QueryId,
    ) -> Result<Arc<QueryToSocketDistributor>, HubError> {
        self.acquire(id, false).await
    }

    /// Number of ids the hub currently tracks
    #[cfg(test)]
    async fn len(&self) -> usize {
        let (respond_to, response) = oneshot::channel();
        if self.commands.send(HubCommand::Len { respond_to }).is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }
}

struct HubActor {
    distributors: HashMap<QueryId, HubEntry>,
    next_generation: u64,
    commands: mpsc::WeakUnboundedSender<HubCommand>,
}

impl HubActor {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                HubCommand::Acquire {
                    id,
                    for_sending,
                    respond_to,
                } => {
                    let result = self.acquire(id, for_sending);
                    let _ = respond_to.send(result);
                }
                HubCommand::Cleanup { id, generation } => self.cleanup(&id, generation),
                HubCommand::EndSignalled { id, generation } => {
                    self.unlink(&id, generation);
                }
                #[cfg(test)]
                HubCommand::Len { respond_to } => {
                    let _ = respond_to.send(self.distributors.len());
                }
            }
        }
        tracing::debug!("query_hub_stopped");
    }

    fn acquire(
        &mut self,
        id: QueryId,
        for_sending: bool,
    ) -> Result<Arc<QueryToSocketDistributor>, HubError> {
        let existing = self
            .distributors
            .get(&id)
            .and_then(|entry| entry.distributor.upgrade());
        let distributor = match existing {
            Some(distributor) => distributor,
            None => {
                let Some(commands) = self.commands.upgrade() else {
                    return Err(HubError::Stopped);
                };
                let generation = self.next_generation;
                self.next_generation += 1;
                let distributor = Arc::new(QueryToSocketDistributor::new(
                    id.clone(),
                    generation,
                    commands,
                ));
                self.distributors.insert(
                    id.clone(),
                    HubEntry {
                        distributor: Arc::downgrade(&distributor),
                        generation,
                    },
                );
                tracing::debug!(query_id = %id, generation, "distributor_created");
                distributor
            }
        };
        if for_sending && !distributor.claim_sender() {
            return Err(HubError::SenderAlreadyExists(id));
        }
        Ok(distributor)
    }

    /// The distributor of `generation` was dropped
    fn cleanup(&mut self, id: &QueryId, generation: u64) {
        let stale = self
            .distributors
            .get(id)
            .is_some_and(|entry| entry.generation == generation && entry.distributor.strong_count() == 0);
        if stale {
            self.distributors.remove(id);
            tracing::debug!(query_id = %id, generation, "distributor_removed");
        }
    }

    /// The producer of `generation` is done; later acquisitions start over
    fn unlink(&mut self, id: &QueryId, generation: u64) {
        if self
            .distributors
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.distributors.remove(id);
        }
    }
}

impl Default for QueryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> QueryId {
        QueryId::new(s)
    }

    #[tokio::test]
    async fn test_sender_and_receiver_share_distributor() {
        let hub = QueryHub::new();
        let sender = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        let receiver = hub
            .create_or_acquire_distributor_for_receiving(&id("q"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&sender, &receiver));
        assert_eq!(sender.generation(), receiver.generation());
    }

    #[tokio::test]
    async fn test_receiver_first_then_sender() {
        let hub = QueryHub::new();
        let receiver = hub
            .create_or_acquire_distributor_for_receiving(&id("q"))
            .await
            .unwrap();
        assert!(!receiver.has_sender());
        let sender = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&sender, &receiver));
        assert!(receiver.has_sender());
    }

    #[tokio::test]
    async fn test_second_sender_is_rejected() {
        let hub = QueryHub::new();
        let _first = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        let err = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::SenderAlreadyExists(id("q")));
    }

    #[tokio::test]
    async fn test_new_generation_after_full_release() {
        let hub = QueryHub::new();
        let sender = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        let receiver = hub
            .create_or_acquire_distributor_for_receiving(&id("q"))
            .await
            .unwrap();
        let old_generation = sender.generation();
        // Keeps the allocation alive so the address cannot be reused
        let old = Arc::downgrade(&sender);
        drop(sender);
        drop(receiver);

        let fresh = hub
            .create_or_acquire_distributor_for_receiving(&id("q"))
            .await
            .unwrap();
        assert_ne!(fresh.generation(), old_generation);
        assert!(!std::ptr::eq(old.as_ptr(), Arc::as_ptr(&fresh)));
        assert!(old.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_entry() {
        let hub = QueryHub::new();
        let receiver = hub
            .create_or_acquire_distributor_for_receiving(&id("q"))
            .await
            .unwrap();
        assert_eq!(hub.len().await, 1);
        drop(receiver);
        // The cleanup command is queued before the len query
        assert_eq!(hub.len().await, 0);
    }

    #[tokio::test]
    async fn test_stale_cleanup_does_not_remove_new_generation() {
        let hub = QueryHub::new();
        let first = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        first.signal_end();
        // After the end signal a new producer gets a new generation
        let second = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        assert_ne!(first.generation(), second.generation());
        drop(first);
        let receiver = hub
            .create_or_acquire_distributor_for_receiving(&id("q"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&receiver, &second));
    }

    #[tokio::test]
    async fn test_concurrent_receivers_see_one_distributor() {
        let hub = QueryHub::new();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    hub.create_or_acquire_distributor_for_receiving(&id("shared"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut distributors = Vec::new();
        for task in tasks {
            distributors.push(task.await.unwrap());
        }
        let first = &distributors[0];
        assert!(distributors.iter().all(|d| Arc::ptr_eq(d, first)));
    }

    // === Distributor data flow ===

    #[tokio::test]
    async fn test_receiver_replays_history_and_sees_end() {
        let hub = QueryHub::new();
        let sender = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        sender.add_query_status_update("one".into()).unwrap();
        sender.add_query_status_update("two".into()).unwrap();

        let receiver = hub
            .create_or_acquire_distributor_for_receiving(&id("q"))
            .await
            .unwrap();
        assert_eq!(receiver.wait_for_next_data_piece(0).await.unwrap().as_str(), "one");
        assert_eq!(receiver.wait_for_next_data_piece(1).await.unwrap().as_str(), "two");

        let waiter = {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move { receiver.wait_for_next_data_piece(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.add_query_status_update("three".into()).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().as_str(), "three");

        sender.signal_end();
        assert!(receiver.wait_for_next_data_piece(3).await.is_none());
        assert!(matches!(
            sender.add_query_status_update("late".into()),
            Err(HubError::AlreadyFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_end_wakes_pending_receiver() {
        let hub = QueryHub::new();
        let sender = hub
            .create_or_acquire_distributor_for_sending(&id("q"))
            .await
            .unwrap();
        let receiver = Arc::clone(&sender);
        let waiter = tokio::spawn(async move { receiver.wait_for_next_data_piece(0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.signal_end();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }
}

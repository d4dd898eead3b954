use std::sync::Arc;

use super::{HubError, QueryHub, QueryToSocketDistributor};
use crate::registry::{OwningQueryId, QueryId};

/// Producer side of a query's progress updates.
///
/// Owns the query's id lease, so the id stays reserved as long as updates
/// can be sent. Dropping it ends the stream for all observers.
pub struct MessageSender {
    distributor: Arc<QueryToSocketDistributor>,
    owning_id: OwningQueryId,
}

impl MessageSender {
    pub async fn create(owning_id: OwningQueryId, hub: &QueryHub) -> Result<Self, HubError> {
        let distributor = hub
            .create_or_acquire_distributor_for_sending(owning_id.to_query_id())
            .await?;
        Ok(MessageSender {
            distributor,
            owning_id,
        })
    }

    /// Publish one update. Updates after the end are dropped with a log line.
    pub fn send(&self, payload: String) {
        if let Err(e) = self.distributor.add_query_status_update(payload) {
            tracing::warn!(query_id = %self.query_id(), error = %e, "status_update_dropped");
        }
    }

    pub fn query_id(&self) -> &QueryId {
        self.owning_id.to_query_id()
    }

    pub fn owning_id(&self) -> &OwningQueryId {
        &self.owning_id
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("query_id", self.query_id())
            .field("generation", &self.distributor.generation())
            .finish()
    }
}

impl Drop for MessageSender {
    fn drop(&mut self) {
        self.distributor.signal_end();
    }
}

use std::sync::{Arc, Weak};

use super::result::ResultTable;
use super::tree::QueryExecutionTree;
use crate::execution::{AllocationBudget, ResultCache};
use crate::hub::MessageSender;
use crate::index::TripleIndex;

/// The cache shared by all queries of a server
pub type QueryResultCache = ResultCache<Arc<ResultTable>>;

/// Everything the execution of one query needs besides its tree
pub struct QueryExecutionContext {
    index: Arc<TripleIndex>,
    cache: Arc<QueryResultCache>,
    budget: Arc<AllocationBudget>,
    pin_subtrees: bool,
    pin_result: bool,
    progress: Option<ProgressReporter>,
}

impl QueryExecutionContext {
    pub fn new(
        index: Arc<TripleIndex>,
        cache: Arc<QueryResultCache>,
        budget: Arc<AllocationBudget>,
    ) -> Self {
        QueryExecutionContext {
            index,
            cache,
            budget,
            pin_subtrees: false,
            pin_result: false,
            progress: None,
        }
    }

    /// `pin_subtrees` pins every intermediate result, `pin_result` only the
    /// result of the root
    pub fn with_pinning(mut self, pin_subtrees: bool, pin_result: bool) -> Self {
        self.pin_subtrees = pin_subtrees;
        self.pin_result = pin_result;
        self
    }

    /// Publish the runtime information of `root` through `sender` whenever
    /// an operation starts or finishes
    pub fn with_progress(mut self, sender: Arc<MessageSender>, root: &Arc<QueryExecutionTree>) -> Self {
        self.progress = Some(ProgressReporter {
            sender,
            root: Arc::downgrade(root),
        });
        self
    }

    pub fn index(&self) -> &Arc<TripleIndex> {
        &self.index
    }

    pub fn cache(&self) -> &QueryResultCache {
        &self.cache
    }

    pub fn budget(&self) -> &Arc<AllocationBudget> {
        &self.budget
    }

    pub fn pin_subtrees(&self) -> bool {
        self.pin_subtrees
    }

    pub fn pin_result(&self) -> bool {
        self.pin_result
    }

    pub(crate) fn report_progress(&self) {
        if let Some(progress) = &self.progress {
            progress.report();
        }
    }
}

struct ProgressReporter {
    sender: Arc<MessageSender>,
    root: Weak<QueryExecutionTree>,
}

impl ProgressReporter {
    fn report(&self) {
        let Some(root) = self.root.upgrade() else {
            return;
        };
        match serde_json::to_string(&root.runtime_information()) {
            Ok(json) => self.sender.send(json),
            Err(e) => {
                tracing::warn!(query_id = %self.sender.query_id(), error = %e, "progress_serialization_failed");
            }
        }
    }
}

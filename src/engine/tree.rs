use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::context::QueryExecutionContext;
use super::operation::{ComputeScope, Operation};
use super::result::ResultTable;
use super::runtime_info::{RuntimeInformation, RuntimeStatus};
use crate::error::QueryError;
use crate::execution::{CacheResult, CancellationHandle};

#[derive(Debug, Clone, Copy)]
struct NodeState {
    status: RuntimeStatus,
    rows: usize,
    total_time: Duration,
}

/// A planned query: a tree of operations, each child computed before its
/// parent. Subtrees are looked up in (and stored to) the result cache by
/// their cache key.
pub struct QueryExecutionTree {
    operation: Box<dyn Operation>,
    children: Vec<Arc<QueryExecutionTree>>,
    cache_key: String,
    state: Mutex<NodeState>,
    cancellation: OnceLock<Arc<CancellationHandle>>,
    deadline: OnceLock<Instant>,
}

impl QueryExecutionTree {
    pub fn new(operation: Box<dyn Operation>, children: Vec<Arc<QueryExecutionTree>>) -> Arc<Self> {
        let child_keys: Vec<String> = children.iter().map(|c| c.cache_key.clone()).collect();
        let cache_key = operation.cache_key(&child_keys);
        Arc::new(QueryExecutionTree {
            operation,
            children,
            cache_key,
            state: Mutex::new(NodeState {
                status: RuntimeStatus::NotStarted,
                rows: 0,
                total_time: Duration::ZERO,
            }),
            cancellation: OnceLock::new(),
            deadline: OnceLock::new(),
        })
    }

    pub fn leaf(operation: impl Operation + 'static) -> Arc<Self> {
        Self::new(Box::new(operation), Vec::new())
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn variables(&self) -> &[String] {
        self.operation.variables()
    }

    pub fn descriptor(&self) -> String {
        self.operation.descriptor()
    }

    pub fn children(&self) -> &[Arc<QueryExecutionTree>] {
        &self.children
    }

    /// Attach the query's handle to this node and all nodes below
    pub fn recursively_set_cancellation_handle(&self, handle: &Arc<CancellationHandle>) {
        if self.cancellation.set(Arc::clone(handle)).is_err() {
            tracing::warn!(operation = %self.descriptor(), "cancellation_handle_already_set");
        }
        for child in &self.children {
            child.recursively_set_cancellation_handle(handle);
        }
    }

    /// Every node fails with a timeout once `deadline` has passed
    pub fn recursively_set_time_constraint(&self, deadline: Instant) {
        if self.deadline.set(deadline).is_err() {
            tracing::warn!(operation = %self.descriptor(), "time_constraint_already_set");
        }
        for child in &self.children {
            child.recursively_set_time_constraint(deadline);
        }
    }

    pub fn cancellation_handle(&self) -> Option<&Arc<CancellationHandle>> {
        self.cancellation.get()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get().copied()
    }

    /// The result of this subtree, from the cache if possible.
    ///
    /// The root's result is pinned when the context asks for a pinned
    /// result; with `pin_subtrees` every node's result is.
    pub fn get_result(
        &self,
        ctx: &QueryExecutionContext,
        is_root: bool,
    ) -> Result<Arc<ResultTable>, QueryError> {
        let handle = self.cancellation.get().ok_or_else(|| {
            QueryError::internal(format!(
                "No cancellation handle was set for operation \"{}\"",
                self.descriptor()
            ))
        })?;
        let pin = ctx.pin_subtrees() || (is_root && ctx.pin_result());

        let started = Instant::now();
        self.state.lock().status = RuntimeStatus::InProgress;
        ctx.report_progress();

        let outcome = ctx.cache().get_or_compute_cancellable(
            &self.cache_key,
            || self.compute(ctx, handle),
            pin,
            handle,
        );

        let elapsed = started.elapsed();
        match outcome {
            Ok(CacheResult { value, status }) => {
                {
                    let mut state = self.state.lock();
                    state.status = status.into();
                    state.rows = value.num_rows();
                    state.total_time = elapsed;
                }
                tracing::debug!(
                    operation = %self.descriptor(),
                    rows = value.num_rows(),
                    cache_status = ?status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "operation_finished"
                );
                ctx.report_progress();
                Ok(value)
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.status = if e.is_cancellation() {
                        RuntimeStatus::Cancelled
                    } else {
                        RuntimeStatus::Failed
                    };
                    state.total_time = elapsed;
                }
                ctx.report_progress();
                Err(e)
            }
        }
    }

    fn compute(
        &self,
        ctx: &QueryExecutionContext,
        handle: &CancellationHandle,
    ) -> Result<Arc<ResultTable>, QueryError> {
        let inputs = self
            .children
            .iter()
            .map(|child| child.get_result(ctx, false))
            .collect::<Result<Vec<_>, _>>()?;

        let descriptor = self.descriptor();
        let scope = ComputeScope {
            index: ctx.index(),
            handle,
            deadline: self.deadline(),
            descriptor: &descriptor,
        };
        scope.check()?;
        let rows = self.operation.compute(&scope, &inputs)?;
        let table = ResultTable::new(self.variables().to_vec(), rows, ctx.budget())?;
        Ok(Arc::new(table))
    }

    /// Snapshot of this subtree's progress
    pub fn runtime_information(&self) -> RuntimeInformation {
        let state = *self.state.lock();
        RuntimeInformation {
            description: self.descriptor(),
            result_rows: state.rows,
            result_cols: self.variables().len(),
            column_names: self.variables().to_vec(),
            total_time: state.total_time.as_millis() as u64,
            status: state.status,
            children: self
                .children
                .iter()
                .map(|child| child.runtime_information())
                .collect(),
        }
    }
}

impl std::fmt::Debug for QueryExecutionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutionTree")
            .field("cache_key", &self.cache_key)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

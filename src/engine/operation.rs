use std::sync::Arc;
use std::time::Instant;

use super::result::ResultTable;
use crate::error::QueryError;
use crate::execution::{CancellationHandle, CancellationReason};
use crate::index::{Id, TripleIndex};

/// Rows between two cancellation checks inside an operation's loop
pub const ROWS_PER_CANCELLATION_CHECK: usize = 1 << 14;

/// One node of a query execution tree.
///
/// Operations are pure: the result depends only on the index and the
/// results of the children, which is what makes `cache_key` a valid
/// identity for the cache.
pub trait Operation: Send + Sync {
    /// Human readable label used in runtime information
    fn descriptor(&self) -> String;

    /// Deterministic fingerprint of the whole subtree, built from the keys
    /// of the children in child order
    fn cache_key(&self, child_keys: &[String]) -> String;

    /// Result columns
    fn variables(&self) -> &[String];

    fn compute(
        &self,
        scope: &ComputeScope<'_>,
        inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError>;
}

/// What an operation may look at while it computes
pub struct ComputeScope<'a> {
    pub index: &'a TripleIndex,
    pub handle: &'a CancellationHandle,
    pub deadline: Option<Instant>,
    pub descriptor: &'a str,
}

impl ComputeScope<'_> {
    /// Fail if the query was cancelled or ran past its deadline
    pub fn check(&self) -> Result<(), QueryError> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.handle.cancel(CancellationReason::Timeout);
        }
        self.handle.throw_if_cancelled(self.descriptor)?;
        Ok(())
    }

    /// [`ComputeScope::check`] on every `ROWS_PER_CANCELLATION_CHECK`th row
    pub fn check_every(&self, row: usize) -> Result<(), QueryError> {
        if row % ROWS_PER_CANCELLATION_CHECK == 0 {
            self.check()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_check_turns_passed_deadline_into_timeout() {
        let index = TripleIndex::empty();
        let handle = CancellationHandle::new();
        let scope = ComputeScope {
            index: &index,
            handle: &handle,
            deadline: Some(Instant::now() - Duration::from_millis(1)),
            descriptor: "test",
        };
        let err = scope.check().unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(handle.reason(), Some(CancellationReason::Timeout));
    }

    #[test]
    fn test_check_every_skips_rows_between_checks() {
        let index = TripleIndex::empty();
        let handle = CancellationHandle::new();
        handle.cancel(CancellationReason::Manual);
        let scope = ComputeScope {
            index: &index,
            handle: &handle,
            deadline: None,
            descriptor: "test",
        };
        assert!(scope.check_every(1).is_ok());
        assert!(scope.check_every(ROWS_PER_CANCELLATION_CHECK).is_err());
    }
}

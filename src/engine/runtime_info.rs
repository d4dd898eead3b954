//! Per-operation runtime information, sent to `/watch` observers while a
//! query runs and included in every JSON response.

use serde::Serialize;

use crate::execution::CacheStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    NotStarted,
    InProgress,
    Computed,
    CachedPinned,
    CachedNotPinned,
    /// Computed by a concurrent query with the same subtree
    Joined,
    Failed,
    Cancelled,
}

impl From<CacheStatus> for RuntimeStatus {
    fn from(status: CacheStatus) -> Self {
        match status {
            CacheStatus::Computed => RuntimeStatus::Computed,
            CacheStatus::CachedPinned => RuntimeStatus::CachedPinned,
            CacheStatus::CachedNotPinned => RuntimeStatus::CachedNotPinned,
            CacheStatus::Joined => RuntimeStatus::Joined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeInformation {
    pub description: String,
    pub result_rows: usize,
    pub result_cols: usize,
    pub column_names: Vec<String>,
    /// Milliseconds spent in this operation including its children
    pub total_time: u64,
    pub status: RuntimeStatus,
    pub children: Vec<RuntimeInformation>,
}

impl RuntimeInformation {
    /// Number of operations in this subtree
    pub fn num_operations(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(RuntimeInformation::num_operations)
            .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let info = RuntimeInformation {
            description: "Scan ?s <p> ?o".into(),
            result_rows: 3,
            result_cols: 2,
            column_names: vec!["?s".into(), "?o".into()],
            total_time: 4,
            status: RuntimeStatus::CachedNotPinned,
            children: vec![],
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "cached_not_pinned");
        assert_eq!(json["result_rows"], 3);
        assert_eq!(json["column_names"][1], "?o");
        assert_eq!(info.num_operations(), 1);
    }
}

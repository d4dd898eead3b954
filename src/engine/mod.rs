//! Query Engine
//!
//! Planning and evaluation of parsed queries over the [`TripleIndex`]:
//!
//! ```text
//! ParsedQuery
//!     ↓
//! [QueryPlanner]          → QueryExecutionTree (scans, joins, modifiers)
//!     ↓
//! [get_result]            → ResultTable, subtrees via the ResultCache
//!     ↓
//! [export]                → JSON document or CSV/TSV chunks
//! ```
//!
//! [`TripleIndex`]: crate::index::TripleIndex

mod context;
pub mod export;
mod operation;
pub mod operations;
mod planner;
mod result;
mod runtime_info;
mod tree;

pub use context::{QueryExecutionContext, QueryResultCache};
pub use export::{compute_result_as_json, compute_result_as_stream, MediaType, StreamableResult};
pub use operation::{ComputeScope, Operation, ROWS_PER_CANCELLATION_CHECK};
pub use planner::{PlannedQuery, QueryPlanner};
pub use result::ResultTable;
pub use runtime_info::{RuntimeInformation, RuntimeStatus};
pub use tree::QueryExecutionTree;

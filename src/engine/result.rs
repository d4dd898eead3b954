//! Materialized intermediate results

use std::mem::size_of;
use std::sync::Arc;

use crate::error::QueryError;
use crate::execution::{AllocationBudget, CacheableValue, MemoryReservation};
use crate::index::Id;

/// Rows of index ids with one column per variable.
///
/// The memory of the rows is reserved from the shared [`AllocationBudget`]
/// and given back when the table is dropped, so a table evicted from the
/// cache frees its share as soon as the last query using it is done.
pub struct ResultTable {
    variables: Vec<String>,
    rows: Vec<Vec<Id>>,
    reservation: Option<MemoryReservation>,
}

impl ResultTable {
    /// Reserve memory for `rows` and wrap them.
    pub fn new(
        variables: Vec<String>,
        rows: Vec<Vec<Id>>,
        budget: &Arc<AllocationBudget>,
    ) -> Result<Self, QueryError> {
        let bytes = Self::estimate_bytes(variables.len(), rows.len());
        let reservation = budget.try_reserve(bytes)?;
        Ok(ResultTable {
            variables,
            rows,
            reservation: Some(reservation),
        })
    }

    /// A table that is not accounted to any budget
    pub fn unaccounted(variables: Vec<String>, rows: Vec<Vec<Id>>) -> Self {
        ResultTable {
            variables,
            rows,
            reservation: None,
        }
    }

    fn estimate_bytes(width: usize, num_rows: usize) -> usize {
        // Zero-width rows still cost their Vec header
        num_rows.saturating_mul(width.max(1) * size_of::<Id>() + size_of::<Vec<Id>>())
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn rows(&self) -> &[Vec<Id>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.variables.len()
    }

    pub fn column_index(&self, variable: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == variable)
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservation.as_ref().map_or(0, MemoryReservation::bytes)
    }
}

impl CacheableValue for Arc<ResultTable> {
    fn size_in_bytes(&self) -> usize {
        ResultTable::estimate_bytes(self.num_columns(), self.num_rows())
    }
}

impl std::fmt::Debug for ResultTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultTable")
            .field("variables", &self.variables)
            .field("num_rows", &self.rows.len())
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

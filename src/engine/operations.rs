//! The operations a planned query is built from

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::operation::{ComputeScope, Operation};
use super::result::ResultTable;
use crate::error::QueryError;
use crate::index::{Id, TripleIndex};
use crate::sparql::{Term, TriplePattern};

fn input<'a>(inputs: &'a [Arc<ResultTable>], i: usize) -> Result<&'a ResultTable, QueryError> {
    inputs
        .get(i)
        .map(AsRef::as_ref)
        .ok_or_else(|| QueryError::internal(format!("Operation is missing input {i}")))
}

// =============================================================================
// Index scan
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Bound(Id),
    /// Column of the output
    Free(usize),
}

/// All triples matching one pattern
pub struct IndexScan {
    pattern: TriplePattern,
    /// `None` if a constant of the pattern is not in the vocabulary
    slots: Option<[Slot; 3]>,
    variables: Vec<String>,
}

impl IndexScan {
    pub fn new(pattern: TriplePattern, index: &TripleIndex) -> Self {
        let variables: Vec<String> = pattern.variables().into_iter().map(String::from).collect();
        let mut slots = [Slot::Free(0); 3];
        let mut resolved = true;
        for (slot, term) in slots.iter_mut().zip(pattern.terms()) {
            match term {
                Term::Variable(name) => {
                    let column = variables.iter().position(|v| v == name).unwrap_or(0);
                    *slot = Slot::Free(column);
                }
                Term::Constant(constant) => match index.get_id(constant) {
                    Some(id) => *slot = Slot::Bound(id),
                    None => resolved = false,
                },
            }
        }
        IndexScan {
            pattern,
            slots: resolved.then_some(slots),
            variables,
        }
    }

    pub fn pattern(&self) -> &TriplePattern {
        &self.pattern
    }
}

impl Operation for IndexScan {
    fn descriptor(&self) -> String {
        format!("IndexScan {}", self.pattern)
    }

    fn cache_key(&self, _child_keys: &[String]) -> String {
        format!("SCAN {}", self.pattern)
    }

    fn variables(&self) -> &[String] {
        &self.variables
    }

    fn compute(
        &self,
        scope: &ComputeScope<'_>,
        _inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError> {
        let Some(slots) = self.slots else {
            return Ok(Vec::new());
        };
        let bound = slots.map(|slot| match slot {
            Slot::Bound(id) => Some(id),
            Slot::Free(_) => None,
        });
        let mut rows = Vec::new();
        'triples: for (i, triple) in scope.index.scan(bound[0], bound[1], bound[2]).enumerate() {
            scope.check_every(i)?;
            let mut row: Vec<Option<Id>> = vec![None; self.variables.len()];
            for (slot, id) in slots.iter().zip(triple) {
                if let Slot::Free(column) = *slot {
                    // A variable used twice must match the same id
                    match row[column] {
                        Some(existing) if existing != id => continue 'triples,
                        _ => row[column] = Some(id),
                    }
                }
            }
            rows.push(row.into_iter().flatten().collect());
        }
        Ok(rows)
    }
}

// =============================================================================
// Join
// =============================================================================

/// Hash join on all shared variables; a cross product when there are none
pub struct HashJoin {
    join_columns: Vec<(usize, usize)>,
    /// Right columns that are appended to each left row
    right_rest: Vec<usize>,
    variables: Vec<String>,
}

impl HashJoin {
    pub fn new(left: &[String], right: &[String]) -> Self {
        let mut join_columns = Vec::new();
        let mut right_rest = Vec::new();
        let mut variables = left.to_vec();
        for (r, var) in right.iter().enumerate() {
            match left.iter().position(|l| l == var) {
                Some(l) => join_columns.push((l, r)),
                None => {
                    right_rest.push(r);
                    variables.push(var.clone());
                }
            }
        }
        HashJoin {
            join_columns,
            right_rest,
            variables,
        }
    }

    fn join_variables(&self) -> Vec<&str> {
        self.join_columns
            .iter()
            .map(|&(l, _)| self.variables[l].as_str())
            .collect()
    }
}

impl Operation for HashJoin {
    fn descriptor(&self) -> String {
        if self.join_columns.is_empty() {
            "Cartesian product".to_string()
        } else {
            format!("Join on {}", self.join_variables().join(" "))
        }
    }

    fn cache_key(&self, child_keys: &[String]) -> String {
        format!(
            "JOIN ON [{}] (\n{}\n)",
            self.join_variables().join(" "),
            child_keys.join("\n|\n")
        )
    }

    fn variables(&self) -> &[String] {
        &self.variables
    }

    fn compute(
        &self,
        scope: &ComputeScope<'_>,
        inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError> {
        let left = input(inputs, 0)?;
        let right = input(inputs, 1)?;

        let mut buckets: HashMap<Vec<Id>, Vec<&Vec<Id>>> = HashMap::new();
        for (i, row) in right.rows().iter().enumerate() {
            scope.check_every(i)?;
            let key = self.join_columns.iter().map(|&(_, r)| row[r]).collect();
            buckets.entry(key).or_default().push(row);
        }

        let mut rows = Vec::new();
        let mut produced = 0usize;
        for (i, left_row) in left.rows().iter().enumerate() {
            scope.check_every(i)?;
            let key: Vec<Id> = self.join_columns.iter().map(|&(l, _)| left_row[l]).collect();
            let Some(matches) = buckets.get(&key) else {
                continue;
            };
            for right_row in matches {
                scope.check_every(produced)?;
                produced += 1;
                let mut row = Vec::with_capacity(self.variables.len());
                row.extend_from_slice(left_row);
                row.extend(self.right_rest.iter().map(|&r| right_row[r]));
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

// =============================================================================
// Solution modifiers
// =============================================================================

/// Keep the given columns in the given order
pub struct Projection {
    columns: Vec<usize>,
    variables: Vec<String>,
}

impl Projection {
    /// Fails if a selected variable is not a column of the input
    pub fn new(input: &[String], selected: &[String]) -> Result<Self, QueryError> {
        let columns = selected
            .iter()
            .map(|var| {
                input.iter().position(|v| v == var).ok_or_else(|| {
                    QueryError::internal(format!("Variable {var} is not bound by the query body"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Projection {
            columns,
            variables: selected.to_vec(),
        })
    }
}

impl Operation for Projection {
    fn descriptor(&self) -> String {
        format!("Projection {}", self.variables.join(" "))
    }

    fn cache_key(&self, child_keys: &[String]) -> String {
        format!("PROJECT {:?} (\n{}\n)", self.columns, child_keys.join("\n"))
    }

    fn variables(&self) -> &[String] {
        &self.variables
    }

    fn compute(
        &self,
        scope: &ComputeScope<'_>,
        inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError> {
        let table = input(inputs, 0)?;
        let mut rows = Vec::with_capacity(table.num_rows());
        for (i, row) in table.rows().iter().enumerate() {
            scope.check_every(i)?;
            rows.push(self.columns.iter().map(|&c| row[c]).collect());
        }
        Ok(rows)
    }
}

/// Remove duplicate rows, keeping the first occurrence
pub struct Distinct {
    variables: Vec<String>,
}

impl Distinct {
    pub fn new(variables: &[String]) -> Self {
        Distinct {
            variables: variables.to_vec(),
        }
    }
}

impl Operation for Distinct {
    fn descriptor(&self) -> String {
        "Distinct".to_string()
    }

    fn cache_key(&self, child_keys: &[String]) -> String {
        format!("DISTINCT (\n{}\n)", child_keys.join("\n"))
    }

    fn variables(&self) -> &[String] {
        &self.variables
    }

    fn compute(
        &self,
        scope: &ComputeScope<'_>,
        inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError> {
        let table = input(inputs, 0)?;
        let mut seen: HashSet<&[Id]> = HashSet::with_capacity(table.num_rows());
        let mut rows = Vec::new();
        for (i, row) in table.rows().iter().enumerate() {
            scope.check_every(i)?;
            if seen.insert(row.as_slice()) {
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }
}

/// `OFFSET` and `LIMIT`
pub struct OffsetLimit {
    offset: usize,
    limit: Option<usize>,
    variables: Vec<String>,
}

impl OffsetLimit {
    pub fn new(variables: &[String], offset: usize, limit: Option<usize>) -> Self {
        OffsetLimit {
            offset,
            limit,
            variables: variables.to_vec(),
        }
    }
}

impl Operation for OffsetLimit {
    fn descriptor(&self) -> String {
        match self.limit {
            Some(limit) => format!("Offset {} Limit {limit}", self.offset),
            None => format!("Offset {}", self.offset),
        }
    }

    fn cache_key(&self, child_keys: &[String]) -> String {
        format!(
            "OFFSET {} LIMIT {:?} (\n{}\n)",
            self.offset,
            self.limit,
            child_keys.join("\n")
        )
    }

    fn variables(&self) -> &[String] {
        &self.variables
    }

    fn compute(
        &self,
        scope: &ComputeScope<'_>,
        inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError> {
        let table = input(inputs, 0)?;
        scope.check()?;
        let rows = table
            .rows()
            .iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }
}

// =============================================================================
// Leaves without index access
// =============================================================================

/// The distinct predicates of the index, answered from the POS permutation
/// without scanning subjects and objects
pub struct PredicateList {
    variables: Vec<String>,
}

impl PredicateList {
    pub fn new(variable: &str) -> Self {
        PredicateList {
            variables: vec![variable.to_string()],
        }
    }
}

impl Operation for PredicateList {
    fn descriptor(&self) -> String {
        format!("Predicates of the index as {}", self.variables[0])
    }

    fn cache_key(&self, _child_keys: &[String]) -> String {
        "PREDICATE LIST".to_string()
    }

    fn variables(&self) -> &[String] {
        &self.variables
    }

    fn compute(
        &self,
        scope: &ComputeScope<'_>,
        _inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError> {
        scope.check()?;
        Ok(scope
            .index
            .predicate_counts()
            .into_iter()
            .map(|(predicate, _)| vec![predicate])
            .collect())
    }
}

/// The result of an empty group pattern: one row without columns
pub struct NeutralElement;

impl Operation for NeutralElement {
    fn descriptor(&self) -> String {
        "Neutral element".to_string()
    }

    fn cache_key(&self, _child_keys: &[String]) -> String {
        "NEUTRAL ELEMENT".to_string()
    }

    fn variables(&self) -> &[String] {
        &[]
    }

    fn compute(
        &self,
        _scope: &ComputeScope<'_>,
        _inputs: &[Arc<ResultTable>],
    ) -> Result<Vec<Vec<Id>>, QueryError> {
        Ok(vec![Vec::new()])
    }
}

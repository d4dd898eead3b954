//! Query planning
//!
//! Turns a parsed query into an execution tree. Joins are ordered greedily:
//! start with the most selective pattern (most constants), then repeatedly
//! join the next pattern that shares a variable with what has been joined so
//! far. Patterns without any shared variable are joined last as a cartesian
//! product.

use std::sync::Arc;

use super::operations::{Distinct, HashJoin, IndexScan, NeutralElement, OffsetLimit, PredicateList, Projection};
use super::tree::QueryExecutionTree;
use crate::error::QueryError;
use crate::index::TripleIndex;
use crate::sparql::{ParsedQuery, Term, TriplePattern};

/// A parsed query together with its execution tree
pub struct PlannedQuery {
    pub parsed: ParsedQuery,
    pub tree: Arc<QueryExecutionTree>,
}

pub struct QueryPlanner {
    index: Arc<TripleIndex>,
    enable_pattern_trick: bool,
}

impl QueryPlanner {
    pub fn new(index: Arc<TripleIndex>) -> Self {
        QueryPlanner {
            index,
            enable_pattern_trick: true,
        }
    }

    pub fn set_enable_pattern_trick(&mut self, enable: bool) {
        self.enable_pattern_trick = enable;
    }

    pub fn create_execution_tree(&self, query: &ParsedQuery) -> Result<Arc<QueryExecutionTree>, QueryError> {
        if let Some(tree) = self.try_pattern_trick(query) {
            tracing::debug!("pattern_trick_applied");
            return Ok(tree);
        }

        let mut tree = self.plan_joins(&query.patterns);

        let selected = query.selected_variables();
        if tree.variables() != selected.as_slice() {
            let projection = Projection::new(tree.variables(), &selected)?;
            tree = QueryExecutionTree::new(Box::new(projection), vec![tree]);
        }
        if query.distinct {
            let distinct = Distinct::new(tree.variables());
            tree = QueryExecutionTree::new(Box::new(distinct), vec![tree]);
        }
        if query.offset > 0 || query.limit.is_some() {
            let window = OffsetLimit::new(tree.variables(), query.offset, query.limit);
            tree = QueryExecutionTree::new(Box::new(window), vec![tree]);
        }
        Ok(tree)
    }

    /// `SELECT DISTINCT ?p WHERE { ?s ?p ?o }` lists the predicates directly
    fn try_pattern_trick(&self, query: &ParsedQuery) -> Option<Arc<QueryExecutionTree>> {
        if !self.enable_pattern_trick || !query.distinct {
            return None;
        }
        let [pattern] = query.patterns.as_slice() else {
            return None;
        };
        if pattern.variables().len() != 3 {
            return None;
        }
        let predicate = pattern.predicate.as_variable()?;
        if query.selected_variables() != [predicate] {
            return None;
        }
        let mut tree = QueryExecutionTree::leaf(PredicateList::new(predicate));
        if query.offset > 0 || query.limit.is_some() {
            let window = OffsetLimit::new(tree.variables(), query.offset, query.limit);
            tree = QueryExecutionTree::new(Box::new(window), vec![tree]);
        }
        Some(tree)
    }

    fn plan_joins(&self, patterns: &[TriplePattern]) -> Arc<QueryExecutionTree> {
        let mut remaining: Vec<&TriplePattern> = patterns.iter().collect();
        // Most constants first; the sort is stable, so ties keep query order
        remaining.sort_by_key(|pattern| std::cmp::Reverse(num_constants(pattern)));

        if remaining.is_empty() {
            return QueryExecutionTree::leaf(NeutralElement);
        }
        let first = remaining.remove(0);
        let mut tree = self.scan(first);

        while !remaining.is_empty() {
            let next = remaining
                .iter()
                .position(|pattern| {
                    pattern
                        .variables()
                        .iter()
                        .any(|var| tree.variables().iter().any(|v| v == var))
                })
                .unwrap_or(0);
            let pattern = remaining.remove(next);
            let right = self.scan(pattern);
            let join = HashJoin::new(tree.variables(), right.variables());
            tree = QueryExecutionTree::new(Box::new(join), vec![tree, right]);
        }
        tree
    }

    fn scan(&self, pattern: &TriplePattern) -> Arc<QueryExecutionTree> {
        QueryExecutionTree::leaf(IndexScan::new(pattern.clone(), &self.index))
    }
}

fn num_constants(pattern: &TriplePattern) -> usize {
    pattern
        .terms()
        .iter()
        .filter(|term| matches!(term, Term::Constant(_)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{QueryExecutionContext, QueryResultCache};
    use crate::execution::{AllocationBudget, CacheLimits, CancellationHandle};
    use crate::sparql::parse_query;

    fn index() -> Arc<TripleIndex> {
        Arc::new(TripleIndex::from_triples([
            ("<alice>", "<knows>", "<bob>"),
            ("<bob>", "<knows>", "<carol>"),
            ("<carol>", "<knows>", "<alice>"),
            ("<alice>", "<age>", "\"30\""),
            ("<bob>", "<age>", "\"25\""),
            ("<alice>", "<type>", "<Person>"),
        ]))
    }

    fn run(planner: &QueryPlanner, text: &str) -> (Arc<QueryExecutionTree>, Vec<Vec<String>>) {
        let parsed = parse_query(text).unwrap();
        let tree = planner.create_execution_tree(&parsed).unwrap();
        tree.recursively_set_cancellation_handle(&Arc::new(CancellationHandle::new()));
        let ctx = QueryExecutionContext::new(
            Arc::clone(&planner.index),
            Arc::new(QueryResultCache::new(CacheLimits::default())),
            Arc::new(AllocationBudget::unlimited()),
        );
        let table = tree.get_result(&ctx, true).unwrap();
        let rows = table
            .rows()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|id| planner.index.get_term(*id).unwrap().to_string())
                    .collect()
            })
            .collect();
        (tree, rows)
    }

    #[test]
    fn test_join_chain() {
        let planner = QueryPlanner::new(index());
        let (tree, mut rows) = run(
            &planner,
            "SELECT ?a ?c WHERE { ?a <knows> ?b . ?b <knows> ?c }",
        );
        assert_eq!(tree.variables(), ["?a", "?c"]);
        rows.sort();
        assert_eq!(
            rows,
            vec![
                vec!["<alice>", "<carol>"],
                vec!["<bob>", "<alice>"],
                vec!["<carol>", "<bob>"],
            ]
        );
    }

    #[test]
    fn test_most_selective_pattern_first() {
        let planner = QueryPlanner::new(index());
        let parsed =
            parse_query("SELECT ?x ?age WHERE { ?x <age> ?age . ?x <type> <Person> }").unwrap();
        let tree = planner.create_execution_tree(&parsed).unwrap();
        // The join already has the selected columns; its left input is the type scan
        assert_eq!(tree.descriptor(), "Join on ?x");
        assert!(tree.children()[0].descriptor().contains("<Person>"));
        let (_, rows) = run(
            &planner,
            "SELECT ?x ?age WHERE { ?x <age> ?age . ?x <type> <Person> }",
        );
        assert_eq!(rows, vec![vec!["<alice>", "\"30\""]]);
    }

    #[test]
    fn test_distinct_limit_offset() {
        let planner = QueryPlanner::new(index());
        let (tree, rows) = run(
            &planner,
            "SELECT DISTINCT ?s WHERE { ?s ?p ?o } LIMIT 2 OFFSET 1",
        );
        assert!(tree.descriptor().starts_with("Offset 1 Limit 2"));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_pattern_trick() {
        let planner = QueryPlanner::new(index());
        let (tree, mut rows) = run(&planner, "SELECT DISTINCT ?p WHERE { ?s ?p ?o }");
        assert!(tree.descriptor().starts_with("Predicates"));
        rows.sort();
        assert_eq!(rows, vec![vec!["<age>"], vec!["<knows>"], vec!["<type>"]]);

        let mut without = QueryPlanner::new(index());
        without.set_enable_pattern_trick(false);
        let (tree, mut plain_rows) = run(&without, "SELECT DISTINCT ?p WHERE { ?s ?p ?o }");
        assert_eq!(tree.descriptor(), "Distinct");
        plain_rows.sort();
        assert_eq!(plain_rows, rows);
    }

    #[test]
    fn test_pattern_trick_needs_distinct() {
        let planner = QueryPlanner::new(index());
        let (tree, rows) = run(&planner, "SELECT ?p WHERE { ?s ?p ?o }");
        assert!(tree.descriptor().starts_with("Projection"));
        assert_eq!(rows.len(), 6);
    }

    #[test]
    fn test_empty_group_pattern() {
        let planner = QueryPlanner::new(index());
        let (tree, rows) = run(&planner, "SELECT * WHERE { }");
        assert!(tree.variables().is_empty());
        assert_eq!(rows, vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_unconnected_patterns_form_cross_product() {
        let planner = QueryPlanner::new(index());
        let (tree, rows) = run(
            &planner,
            "SELECT * WHERE { ?a <age> ?x . ?b <type> ?t }",
        );
        assert_eq!(tree.descriptor(), "Cartesian product");
        assert_eq!(rows.len(), 2);
    }
}

//! SPARQL parsing
//!
//! A PEG grammar (`sparql.pest`) for SELECT queries over basic graph
//! patterns. Constants are normalized to their N-Triples spelling
//! (`<iri>`, `"lexical"@lang`, `"lexical"^^<datatype>`, `_:label`), which is
//! also how the triple index stores them.

pub mod highlight;

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::error::{ParseMetadata, QueryError};

#[derive(Parser)]
#[grammar = "sparql/sparql.pest"]
struct SparqlParser;

pub const RDF_TYPE: &str = "<http://www.w3.org/1999/02/22-rdf-syntax-ns#type>";
pub const XSD_INTEGER: &str = "<http://www.w3.org/2001/XMLSchema#integer>";

/// A position in a triple pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Term {
    /// Variable name including the leading `?`
    Variable(String),
    /// Constant in N-Triples spelling
    Constant(String),
}

impl Term {
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Term::Variable(name) => Some(name),
            Term::Constant(_) => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Variable(name) | Term::Constant(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl TriplePattern {
    pub fn terms(&self) -> [&Term; 3] {
        [&self.subject, &self.predicate, &self.object]
    }

    /// Distinct variables in subject, predicate, object order
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for term in self.terms() {
            if let Some(var) = term.as_variable() {
                if !vars.contains(&var) {
                    vars.push(var);
                }
            }
        }
        vars
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Projection {
    All,
    Variables(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedQuery {
    /// The query as it was sent
    pub text: String,
    pub projection: Projection,
    pub distinct: bool,
    pub patterns: Vec<TriplePattern>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ParsedQuery {
    /// The columns of the result: the projected variables, or every variable
    /// of the body in order of first appearance for `SELECT *`
    pub fn selected_variables(&self) -> Vec<String> {
        match &self.projection {
            Projection::Variables(vars) => vars.clone(),
            Projection::All => {
                let mut vars: Vec<String> = Vec::new();
                for pattern in &self.patterns {
                    for var in pattern.variables() {
                        if !vars.iter().any(|v| v == var) {
                            vars.push(var.to_string());
                        }
                    }
                }
                vars
            }
        }
    }
}

/// A query that does not parse, with the offending position
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub metadata: ParseMetadata,
}

impl ParseError {
    fn at_span(query: &str, start: usize, end: usize, message: String) -> Self {
        let (line, position_in_line) = line_and_column(query, start);
        ParseError {
            message,
            metadata: ParseMetadata {
                start_index: start,
                stop_index: end.saturating_sub(1).max(start),
                line,
                position_in_line,
                query: query.to_string(),
            },
        }
    }

    fn from_pest(query: &str, error: &pest::error::Error<Rule>) -> Self {
        let (start, end) = match error.location {
            pest::error::InputLocation::Pos(pos) => (pos, pos + 1),
            pest::error::InputLocation::Span((start, end)) => (start, end),
        };
        let (line, column) = match error.line_col {
            pest::error::LineColLocation::Pos(pos) | pest::error::LineColLocation::Span(pos, _) => {
                pos
            }
        };
        let start = start.min(query.len());
        ParseError {
            message: format!(
                "Invalid SPARQL query: {} (line {line}, position {})",
                error.variant.message(),
                column.saturating_sub(1)
            ),
            metadata: ParseMetadata {
                start_index: start,
                stop_index: end.saturating_sub(1).max(start),
                line,
                position_in_line: column.saturating_sub(1),
                query: query.to_string(),
            },
        }
    }

    /// The query with the offending part highlighted for a terminal
    pub fn colored_error(&self) -> String {
        highlight::colored_error(&self.metadata)
    }
}

impl From<ParseError> for QueryError {
    fn from(e: ParseError) -> Self {
        QueryError::Parse {
            message: e.message,
            metadata: Some(e.metadata),
        }
    }
}

/// 1-based line and 0-based column of byte offset `offset`
fn line_and_column(text: &str, offset: usize) -> (usize, usize) {
    let before = text.get(..offset).unwrap_or(text);
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1);
    (line, column)
}

pub fn parse_query(text: &str) -> Result<ParsedQuery, ParseError> {
    let mut pairs =
        SparqlParser::parse(Rule::query, text).map_err(|e| ParseError::from_pest(text, &e))?;
    let Some(query) = pairs.next() else {
        return Err(ParseError::at_span(text, 0, 0, "Empty query".to_string()));
    };

    let mut prefixes: HashMap<String, String> = HashMap::new();
    let mut parsed = ParsedQuery {
        text: text.to_string(),
        projection: Projection::All,
        distinct: false,
        patterns: Vec::new(),
        limit: None,
        offset: 0,
    };
    let mut projection_pairs = Vec::new();

    for pair in query.into_inner() {
        match pair.as_rule() {
            Rule::prefix_decl => {
                let mut inner = pair.into_inner();
                let (Some(ns), Some(iri)) = (inner.next(), inner.next()) else {
                    continue;
                };
                let ns = ns.as_str().trim_end_matches(':').to_string();
                let iri = iri.as_str();
                prefixes.insert(ns, iri[1..iri.len() - 1].to_string());
            }
            Rule::select_clause => {
                let mut vars = Vec::new();
                for item in pair.into_inner() {
                    match item.as_rule() {
                        Rule::distinct => parsed.distinct = true,
                        Rule::var => {
                            vars.push(normalize_variable(item.as_str()));
                            projection_pairs.push(item);
                        }
                        _ => {}
                    }
                }
                if !vars.is_empty() {
                    parsed.projection = Projection::Variables(vars);
                }
            }
            Rule::where_clause => {
                for block in pair.into_inner() {
                    for triple in block.into_inner() {
                        parsed
                            .patterns
                            .push(build_triple(text, triple, &prefixes)?);
                    }
                }
            }
            Rule::solution_modifier => {
                for modifier in pair.into_inner() {
                    let rule = modifier.as_rule();
                    let Some(number) = modifier.into_inner().next() else {
                        continue;
                    };
                    let value = parse_count(text, &number)?;
                    if rule == Rule::limit_clause {
                        parsed.limit = Some(value);
                    } else {
                        parsed.offset = value;
                    }
                }
            }
            _ => {}
        }
    }

    // Projected variables must be bound by the body
    let body_vars: Vec<String> = parsed
        .patterns
        .iter()
        .flat_map(|p| p.variables().into_iter().map(str::to_string))
        .collect();
    for pair in projection_pairs {
        let name = normalize_variable(pair.as_str());
        if !body_vars.contains(&name) {
            let span = pair.as_span();
            return Err(ParseError::at_span(
                text,
                span.start(),
                span.end(),
                format!("Variable {name} is selected but not used in the query body"),
            ));
        }
    }

    Ok(parsed)
}

fn normalize_variable(raw: &str) -> String {
    format!("?{}", &raw[1..])
}

fn parse_count(text: &str, pair: &Pair<'_, Rule>) -> Result<usize, ParseError> {
    pair.as_str().parse::<usize>().map_err(|_| {
        let span = pair.as_span();
        ParseError::at_span(
            text,
            span.start(),
            span.end(),
            format!("Expected a non-negative integer, got {}", pair.as_str()),
        )
    })
}

fn build_triple(
    text: &str,
    triple: Pair<'_, Rule>,
    prefixes: &HashMap<String, String>,
) -> Result<TriplePattern, ParseError> {
    let mut terms = Vec::with_capacity(3);
    for position in triple.into_inner() {
        let Some(term) = position.into_inner().next() else {
            continue;
        };
        terms.push(build_term(text, term, prefixes)?);
    }
    let [subject, predicate, object]: [Term; 3] = terms.try_into().map_err(|_| {
        ParseError::at_span(text, 0, text.len(), "Incomplete triple pattern".to_string())
    })?;
    Ok(TriplePattern {
        subject,
        predicate,
        object,
    })
}

fn build_term(
    text: &str,
    pair: Pair<'_, Rule>,
    prefixes: &HashMap<String, String>,
) -> Result<Term, ParseError> {
    let term = match pair.as_rule() {
        Rule::var => Term::Variable(normalize_variable(pair.as_str())),
        Rule::a_keyword => Term::Constant(RDF_TYPE.to_string()),
        Rule::iri_ref | Rule::blank_node => Term::Constant(pair.as_str().to_string()),
        Rule::prefixed_name => Term::Constant(expand_prefixed(text, &pair, prefixes)?),
        Rule::integer => Term::Constant(format!("\"{}\"^^{XSD_INTEGER}", pair.as_str())),
        Rule::literal => {
            let mut inner = pair.into_inner();
            let lexical = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
            match inner.next() {
                None => Term::Constant(lexical),
                Some(suffix) if suffix.as_rule() == Rule::lang_tag => {
                    Term::Constant(format!("{lexical}{}", suffix.as_str()))
                }
                Some(datatype) => {
                    let datatype = if datatype.as_rule() == Rule::prefixed_name {
                        expand_prefixed(text, &datatype, prefixes)?
                    } else {
                        datatype.as_str().to_string()
                    };
                    Term::Constant(format!("{lexical}^^{datatype}"))
                }
            }
        }
        _ => {
            let span = pair.as_span();
            return Err(ParseError::at_span(
                text,
                span.start(),
                span.end(),
                format!("Unexpected term {}", pair.as_str()),
            ));
        }
    };
    Ok(term)
}

fn expand_prefixed(
    text: &str,
    pair: &Pair<'_, Rule>,
    prefixes: &HashMap<String, String>,
) -> Result<String, ParseError> {
    let raw = pair.as_str();
    let (prefix, local) = raw.split_once(':').unwrap_or((raw, ""));
    match prefixes.get(prefix) {
        Some(iri) => Ok(format!("<{iri}{local}>")),
        None => {
            let span = pair.as_span();
            Err(ParseError::at_span(
                text,
                span.start(),
                span.end(),
                format!("Prefix {prefix}: was not registered using a PREFIX declaration"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Term {
        Term::Variable(name.to_string())
    }

    fn constant(value: &str) -> Term {
        Term::Constant(value.to_string())
    }

    #[test]
    fn test_select_star_single_pattern() {
        let q = parse_query("SELECT * WHERE { ?s ?p ?o }").unwrap();
        assert_eq!(q.projection, Projection::All);
        assert!(!q.distinct);
        assert_eq!(q.patterns.len(), 1);
        assert_eq!(q.selected_variables(), vec!["?s", "?p", "?o"]);
        assert_eq!(q.limit, None);
        assert_eq!(q.offset, 0);
    }

    #[test]
    fn test_prefixes_and_a_keyword() {
        let q = parse_query(
            "PREFIX ex: <http://example.org/>\n\
             SELECT ?name WHERE { ?x a ex:Person . ?x ex:name ?name . }",
        )
        .unwrap();
        assert_eq!(q.patterns.len(), 2);
        assert_eq!(q.patterns[0].predicate, constant(RDF_TYPE));
        assert_eq!(q.patterns[0].object, constant("<http://example.org/Person>"));
        assert_eq!(q.patterns[1].object, var("?name"));
        assert_eq!(q.selected_variables(), vec!["?name"]);
    }

    #[test]
    fn test_literals() {
        let q = parse_query(
            r#"PREFIX xsd: <http://www.w3.org/2001/XMLSchema#>
               SELECT ?s { ?s <p> "plain" . ?s <q> "hallo"@de . ?s <r> "5"^^xsd:int . ?s <t> 42 }"#,
        )
        .unwrap();
        let objects: Vec<_> = q.patterns.iter().map(|p| p.object.clone()).collect();
        assert_eq!(objects[0], constant("\"plain\""));
        assert_eq!(objects[1], constant("\"hallo\"@de"));
        assert_eq!(
            objects[2],
            constant("\"5\"^^<http://www.w3.org/2001/XMLSchema#int>")
        );
        assert_eq!(objects[3], constant(&format!("\"42\"^^{XSD_INTEGER}")));
    }

    #[test]
    fn test_distinct_limit_offset_case_insensitive() {
        let q = parse_query("select distinct ?p where { ?s ?p ?o } offset 5 limit 10").unwrap();
        assert!(q.distinct);
        assert_eq!(q.limit, Some(10));
        assert_eq!(q.offset, 5);
    }

    #[test]
    fn test_dollar_variables_are_normalized() {
        let q = parse_query("SELECT $x { $x <p> ?y }").unwrap();
        assert_eq!(q.patterns[0].subject, var("?x"));
        assert_eq!(q.selected_variables(), vec!["?x"]);
    }

    #[test]
    fn test_comments_and_blank_nodes() {
        let q = parse_query("# find things\nSELECT ?o { _:b1 <p> ?o }").unwrap();
        assert_eq!(q.patterns[0].subject, constant("_:b1"));
    }

    #[test]
    fn test_syntax_error_position() {
        let err = parse_query("SELECT * WHERE {\n  ?s ?p }").unwrap_err();
        assert_eq!(err.metadata.line, 2);
        assert!(err.message.starts_with("Invalid SPARQL query"));
        assert!(err.metadata.start_index <= err.metadata.stop_index);
        assert_eq!(err.metadata.query, "SELECT * WHERE {\n  ?s ?p }");
    }

    #[test]
    fn test_unknown_prefix_reports_span() {
        let text = "SELECT * { ?s foo:bar ?o }";
        let err = parse_query(text).unwrap_err();
        assert!(err.message.contains("foo:"));
        assert_eq!(&text[err.metadata.start_index..=err.metadata.stop_index], "foo:bar");
        assert_eq!(err.metadata.line, 1);
        assert_eq!(err.metadata.position_in_line, 14);
    }

    #[test]
    fn test_unbound_projection_is_rejected() {
        let err = parse_query("SELECT ?missing { ?s ?p ?o }").unwrap_err();
        assert!(err.message.contains("?missing"));
        assert_eq!(err.metadata.start_index, 7);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_query("").is_err());
        assert!(parse_query("DELETE WHERE { ?s ?p ?o }").is_err());
        assert!(parse_query("SELECT * { ?s ?p ?o } LIMIT -1").is_err());
    }

    #[test]
    fn test_parse_error_converts_to_bad_request_class() {
        let err: QueryError = parse_query("SELECT").unwrap_err().into();
        assert_eq!(err.status_code(), 400);
        assert!(err.parse_metadata().is_some());
    }
}

//! Result export
//!
//! JSON formats are built in one piece (and cut off after `max_send` rows).
//! CSV, TSV, SPARQL XML and the binary id export are produced lazily in
//! chunks so a large result can be streamed to the client while it is
//! serialized.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use quick_xml::escape::escape;
use serde_json::{json, Map, Value};

use super::context::QueryExecutionContext;
use super::operation::ROWS_PER_CANCELLATION_CHECK;
use super::planner::PlannedQuery;
use super::result::ResultTable;
use crate::error::QueryError;
use crate::execution::CancellationHandle;
use crate::index::{Id, TripleIndex};

/// Rows per chunk of a streamed export
pub const STREAM_CHUNK_ROWS: usize = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    QleverJson,
    SparqlJson,
    SparqlXml,
    Csv,
    Tsv,
    /// Raw index ids, row by row, each as 8 little-endian bytes
    OctetStream,
}

impl MediaType {
    pub const ALL: [MediaType; 6] = [
        MediaType::QleverJson,
        MediaType::SparqlJson,
        MediaType::SparqlXml,
        MediaType::Csv,
        MediaType::Tsv,
        MediaType::OctetStream,
    ];

    pub fn content_type(self) -> &'static str {
        match self {
            MediaType::QleverJson => "application/qlever-results+json",
            MediaType::SparqlJson => "application/sparql-results+json",
            MediaType::SparqlXml => "application/sparql-results+xml",
            MediaType::Csv => "text/csv",
            MediaType::Tsv => "text/tab-separated-values",
            MediaType::OctetStream => "application/octet-stream",
        }
    }

    /// The format named by an `action=..._export` URL parameter. SPARQL XML
    /// is only reachable through the `Accept` header.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "qlever_json_export" => Some(MediaType::QleverJson),
            "sparql_json_export" => Some(MediaType::SparqlJson),
            "csv_export" => Some(MediaType::Csv),
            "tsv_export" => Some(MediaType::Tsv),
            "binary_export" => Some(MediaType::OctetStream),
            _ => None,
        }
    }

    /// Only the JSON formats are sent in one piece
    pub fn is_streamed(self) -> bool {
        !matches!(self, MediaType::QleverJson | MediaType::SparqlJson)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_type())
    }
}

fn export_check(handle: Option<&Arc<CancellationHandle>>, row: usize) -> Result<(), QueryError> {
    if row % ROWS_PER_CANCELLATION_CHECK == 0 {
        if let Some(handle) = handle {
            handle.throw_if_cancelled("exporting the result")?;
        }
    }
    Ok(())
}

fn term<'a>(index: &'a TripleIndex, id: Id) -> Result<&'a str, QueryError> {
    index
        .get_term(id)
        .ok_or_else(|| QueryError::internal(format!("Id {id} is not in the vocabulary")))
}

fn millis(since: Instant) -> String {
    format!("{}ms", since.elapsed().as_millis())
}

// =============================================================================
// JSON
// =============================================================================

/// Compute the result of `planned` and render it as a JSON document
pub fn compute_result_as_json(
    planned: &PlannedQuery,
    ctx: &QueryExecutionContext,
    request_timer: Instant,
    max_send: usize,
    format: MediaType,
) -> Result<Value, QueryError> {
    let compute_timer = Instant::now();
    let table = planned.tree.get_result(ctx, true)?;
    let compute_time = millis(compute_timer);
    let handle = planned.tree.cancellation_handle();

    match format {
        MediaType::QleverJson => {
            let mut res = Vec::with_capacity(table.num_rows().min(max_send));
            for (i, row) in table.rows().iter().take(max_send).enumerate() {
                export_check(handle, i)?;
                let terms = row
                    .iter()
                    .map(|id| term(ctx.index(), *id).map(|t| Value::String(t.to_string())))
                    .collect::<Result<Vec<_>, _>>()?;
                res.push(Value::Array(terms));
            }
            Ok(json!({
                "query": planned.parsed.text,
                "status": "OK",
                "resultsize": table.num_rows(),
                "selected": table.variables(),
                "res": res,
                "runtimeInformation": planned.tree.runtime_information(),
                "time": {
                    "total": millis(request_timer),
                    "computeResult": compute_time,
                },
            }))
        }
        MediaType::SparqlJson => {
            let vars: Vec<&str> = table
                .variables()
                .iter()
                .map(|v| v.trim_start_matches('?'))
                .collect();
            let mut bindings = Vec::with_capacity(table.num_rows().min(max_send));
            for (i, row) in table.rows().iter().take(max_send).enumerate() {
                export_check(handle, i)?;
                let mut binding = Map::new();
                for (var, id) in vars.iter().zip(row) {
                    binding.insert((*var).to_string(), sparql_json_term(term(ctx.index(), *id)?));
                }
                bindings.push(Value::Object(binding));
            }
            Ok(json!({
                "head": { "vars": vars },
                "results": { "bindings": bindings },
            }))
        }
        _ => Err(QueryError::internal(format!(
            "{format} is not a JSON format"
        ))),
    }
}

fn sparql_json_term(term: &str) -> Value {
    match classify(term) {
        TermKind::Iri(iri) => json!({ "type": "uri", "value": iri }),
        TermKind::Blank(label) => json!({ "type": "bnode", "value": label }),
        TermKind::Literal {
            lexical,
            language,
            datatype,
        } => {
            let mut object = Map::new();
            object.insert("type".into(), "literal".into());
            object.insert("value".into(), lexical.into());
            if let Some(language) = language {
                object.insert("xml:lang".into(), language.into());
            }
            if let Some(datatype) = datatype {
                object.insert("datatype".into(), datatype.into());
            }
            Value::Object(object)
        }
        TermKind::Other(raw) => json!({ "type": "literal", "value": raw }),
    }
}

// =============================================================================
// Term spelling
// =============================================================================

enum TermKind<'a> {
    Iri(&'a str),
    Blank(&'a str),
    Literal {
        lexical: String,
        language: Option<&'a str>,
        datatype: Option<&'a str>,
    },
    Other(&'a str),
}

fn classify(term: &str) -> TermKind<'_> {
    if let Some(iri) = term.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        return TermKind::Iri(iri);
    }
    if let Some(label) = term.strip_prefix("_:") {
        return TermKind::Blank(label);
    }
    if term.starts_with('"') {
        if let Some(close) = term.rfind('"').filter(|&close| close > 0) {
            let suffix = &term[close + 1..];
            let language = suffix.strip_prefix('@');
            let datatype = suffix
                .strip_prefix("^^<")
                .and_then(|dt| dt.strip_suffix('>'));
            return TermKind::Literal {
                lexical: unescape(&term[1..close]),
                language,
                datatype,
            };
        }
    }
    TermKind::Other(term)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// CSV shows plain values: IRIs without brackets, literals without quotes
fn csv_value(term: &str) -> String {
    match classify(term) {
        TermKind::Iri(iri) => iri.to_string(),
        TermKind::Literal { lexical, .. } => lexical,
        TermKind::Blank(_) | TermKind::Other(_) => term.to_string(),
    }
}

/// TSV keeps the N-Triples spelling; tabs and newlines become spaces
fn tsv_value(term: &str) -> String {
    term.replace(['\t', '\n'], " ")
}

fn xml_binding(out: &mut String, var: &str, term: &str) {
    out.push_str("\n    <binding name=\"");
    out.push_str(&escape(var));
    out.push_str("\">");
    match classify(term) {
        TermKind::Iri(iri) => {
            out.push_str("<uri>");
            out.push_str(&escape(iri));
            out.push_str("</uri>");
        }
        TermKind::Blank(label) => {
            out.push_str("<bnode>");
            out.push_str(&escape(label));
            out.push_str("</bnode>");
        }
        TermKind::Literal {
            lexical,
            language,
            datatype,
        } => {
            out.push_str("<literal");
            if let Some(language) = language {
                out.push_str(" xml:lang=\"");
                out.push_str(&escape(language));
                out.push('"');
            } else if let Some(datatype) = datatype {
                out.push_str(" datatype=\"");
                out.push_str(&escape(datatype));
                out.push('"');
            }
            out.push('>');
            out.push_str(&escape(lexical.as_str()));
            out.push_str("</literal>");
        }
        TermKind::Other(raw) => {
            out.push_str("<literal>");
            out.push_str(&escape(raw));
            out.push_str("</literal>");
        }
    }
    out.push_str("</binding>");
}

// =============================================================================
// Streamed formats
// =============================================================================

const XML_PROLOGUE: &str = "<?xml version=\"1.0\"?>\n<sparql xmlns=\"http://www.w3.org/2005/sparql-results#\">\n<head>";
const XML_TRAILER: &str = "\n</results>\n</sparql>";

/// Compute the result of `planned` and return an iterator over chunks of
/// its rendering in one of the streamed formats
pub fn compute_result_as_stream(
    planned: &PlannedQuery,
    ctx: &QueryExecutionContext,
    format: MediaType,
) -> Result<StreamableResult, QueryError> {
    if !format.is_streamed() {
        return Err(QueryError::internal(format!(
            "{format} cannot be streamed"
        )));
    }
    let table = planned.tree.get_result(ctx, true)?;
    Ok(StreamableResult {
        table,
        index: Arc::clone(ctx.index()),
        handle: planned.tree.cancellation_handle().cloned(),
        format,
        next_row: 0,
        phase: Phase::Header,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Rows,
    Trailer,
    Done,
}

/// Lazily serialized chunks: a header (none for the binary export), the
/// rows in blocks of [`STREAM_CHUNK_ROWS`], and the XML closing tags.
pub struct StreamableResult {
    table: Arc<ResultTable>,
    index: Arc<TripleIndex>,
    handle: Option<Arc<CancellationHandle>>,
    format: MediaType,
    next_row: usize,
    phase: Phase,
}

impl StreamableResult {
    pub fn format(&self) -> MediaType {
        self.format
    }

    fn writer(&self) -> csv::Writer<Vec<u8>> {
        let mut builder = csv::WriterBuilder::new();
        builder.terminator(csv::Terminator::Any(b'\n'));
        if self.format == MediaType::Tsv {
            builder.delimiter(b'\t').quote_style(csv::QuoteStyle::Never);
        }
        builder.from_writer(Vec::new())
    }

    fn header(&self) -> Result<Option<Vec<u8>>, QueryError> {
        let bare = || self.table.variables().iter().map(|v| v.trim_start_matches('?'));
        match self.format {
            MediaType::OctetStream => Ok(None),
            MediaType::SparqlXml => {
                let mut out = String::from(XML_PROLOGUE);
                for var in bare() {
                    out.push_str("\n  <variable name=\"");
                    out.push_str(&escape(var));
                    out.push_str("\"/>");
                }
                out.push_str("\n</head>\n<results>");
                Ok(Some(out.into_bytes()))
            }
            MediaType::Tsv => {
                let mut writer = self.writer();
                writer.write_record(self.table.variables()).map_err(csv_error)?;
                finish(writer).map(Some)
            }
            _ => {
                let mut writer = self.writer();
                writer.write_record(bare()).map_err(csv_error)?;
                finish(writer).map(Some)
            }
        }
    }

    fn next_chunk(&mut self) -> Result<Vec<u8>, QueryError> {
        if let Some(handle) = &self.handle {
            handle.throw_if_cancelled("streaming the result")?;
        }
        let end = (self.next_row + STREAM_CHUNK_ROWS).min(self.table.num_rows());
        let rows = &self.table.rows()[self.next_row..end];
        let chunk: Vec<u8> = match self.format {
            MediaType::OctetStream => rows
                .iter()
                .flatten()
                .flat_map(|id| id.to_le_bytes())
                .collect(),
            MediaType::SparqlXml => {
                let vars: Vec<&str> = self
                    .table
                    .variables()
                    .iter()
                    .map(|v| v.trim_start_matches('?'))
                    .collect();
                let mut out = String::new();
                for row in rows {
                    out.push_str("\n  <result>");
                    for (var, id) in vars.iter().zip(row) {
                        xml_binding(&mut out, var, term(&self.index, *id)?);
                    }
                    out.push_str("\n  </result>");
                }
                out.into_bytes()
            }
            _ => {
                let mut writer = self.writer();
                for row in rows {
                    let mut record = Vec::with_capacity(row.len());
                    for id in row {
                        let term = term(&self.index, *id)?;
                        record.push(match self.format {
                            MediaType::Tsv => tsv_value(term),
                            _ => csv_value(term),
                        });
                    }
                    writer.write_record(&record).map_err(csv_error)?;
                }
                finish(writer)?
            }
        };
        self.next_row = end;
        Ok(chunk)
    }
}

fn csv_error(e: csv::Error) -> QueryError {
    QueryError::internal(format!("Could not serialize a result row: {e}"))
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, QueryError> {
    writer
        .into_inner()
        .map_err(|e| QueryError::internal(format!("Could not flush a result chunk: {e}")))
}

impl Iterator for StreamableResult {
    type Item = Result<Vec<u8>, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = match self.phase {
                Phase::Done => return None,
                Phase::Header => {
                    self.phase = Phase::Rows;
                    match self.header() {
                        Ok(None) => continue,
                        other => other.map(Option::unwrap_or_default),
                    }
                }
                Phase::Rows => {
                    if self.next_row >= self.table.num_rows() {
                        self.phase = Phase::Trailer;
                        continue;
                    }
                    self.next_chunk()
                }
                Phase::Trailer => {
                    self.phase = Phase::Done;
                    if self.format != MediaType::SparqlXml {
                        return None;
                    }
                    Ok(XML_TRAILER.as_bytes().to_vec())
                }
            };
            if chunk.is_err() {
                self.phase = Phase::Done;
            }
            return Some(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::QueryResultCache;
    use crate::engine::planner::QueryPlanner;
    use crate::execution::{AllocationBudget, CacheLimits, CancellationReason};
    use crate::sparql::parse_query;

    fn index() -> Arc<TripleIndex> {
        Arc::new(TripleIndex::from_triples([
            ("<s>", "<p>", "<http://example.org/o>"),
            ("<s>", "<label>", "\"Some\\\"Where\tOver,\"@en-ca"),
            ("<s>", "<num>", "\"42\"^^<http://www.w3.org/2001/XMLSchema#int>"),
            ("<s>", "<node>", "_:b0"),
        ]))
    }

    fn plan(index: &Arc<TripleIndex>, text: &str) -> (PlannedQuery, QueryExecutionContext) {
        let parsed = parse_query(text).unwrap();
        let tree = QueryPlanner::new(Arc::clone(index))
            .create_execution_tree(&parsed)
            .unwrap();
        tree.recursively_set_cancellation_handle(&Arc::new(CancellationHandle::new()));
        let ctx = QueryExecutionContext::new(
            Arc::clone(index),
            Arc::new(QueryResultCache::new(CacheLimits::default())),
            Arc::new(AllocationBudget::unlimited()),
        );
        (PlannedQuery { parsed, tree }, ctx)
    }

    fn stream_bytes(index: &Arc<TripleIndex>, text: &str, format: MediaType) -> Vec<u8> {
        let (planned, ctx) = plan(index, text);
        compute_result_as_stream(&planned, &ctx, format)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
            .concat()
    }

    fn stream(text: &str, format: MediaType) -> String {
        String::from_utf8(stream_bytes(&index(), text, format)).unwrap()
    }

    fn xml_document(vars: &[&str], results: &str) -> String {
        let mut doc = String::from(
            "<?xml version=\"1.0\"?>\n<sparql xmlns=\"http://www.w3.org/2005/sparql-results#\">\n<head>",
        );
        for var in vars {
            doc.push_str(&format!("\n  <variable name=\"{var}\"/>"));
        }
        doc.push_str("\n</head>\n<results>");
        doc.push_str(results);
        doc.push_str("\n</results>\n</sparql>");
        doc
    }

    #[test]
    fn test_media_type_names() {
        assert_eq!(MediaType::from_action("csv_export"), Some(MediaType::Csv));
        assert_eq!(MediaType::from_action("tsv_export"), Some(MediaType::Tsv));
        assert_eq!(MediaType::from_action("sparql_json_export"), Some(MediaType::SparqlJson));
        assert_eq!(MediaType::from_action("qlever_json_export"), Some(MediaType::QleverJson));
        assert_eq!(MediaType::from_action("binary_export"), Some(MediaType::OctetStream));
        assert_eq!(MediaType::from_action("xml_export"), None);
        assert_eq!(MediaType::from_action("turtle_export"), None);
        assert!(MediaType::Tsv.is_streamed());
        assert!(MediaType::SparqlXml.is_streamed());
        assert!(MediaType::OctetStream.is_streamed());
        assert!(!MediaType::SparqlJson.is_streamed());
    }

    #[test]
    fn test_tsv_iri() {
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <p> ?o }", MediaType::Tsv),
            "?o\n<http://example.org/o>\n"
        );
    }

    #[test]
    fn test_csv_iri() {
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <p> ?o }", MediaType::Csv),
            "o\nhttp://example.org/o\n"
        );
    }

    #[test]
    fn test_literal_with_language_tag() {
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <label> ?o }", MediaType::Tsv),
            "?o\n\"Some\\\"Where Over,\"@en-ca\n"
        );
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <label> ?o }", MediaType::Csv),
            "o\n\"Some\"\"Where\tOver,\"\n"
        );
    }

    #[test]
    fn test_sparql_xml_iri() {
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <p> ?o }", MediaType::SparqlXml),
            xml_document(
                &["o"],
                "\n  <result>\n    <binding name=\"o\"><uri>http://example.org/o</uri></binding>\n  </result>"
            )
        );
    }

    #[test]
    fn test_sparql_xml_literals_and_blank_nodes() {
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <label> ?o }", MediaType::SparqlXml),
            xml_document(
                &["o"],
                "\n  <result>\n    <binding name=\"o\"><literal xml:lang=\"en-ca\">Some&quot;Where\tOver,</literal></binding>\n  </result>"
            )
        );
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <num> ?o }", MediaType::SparqlXml),
            xml_document(
                &["o"],
                "\n  <result>\n    <binding name=\"o\"><literal datatype=\"http://www.w3.org/2001/XMLSchema#int\">42</literal></binding>\n  </result>"
            )
        );
        assert_eq!(
            stream("SELECT ?o WHERE { <s> <node> ?o }", MediaType::SparqlXml),
            xml_document(
                &["o"],
                "\n  <result>\n    <binding name=\"o\"><bnode>b0</bnode></binding>\n  </result>"
            )
        );
    }

    #[test]
    fn test_sparql_xml_empty_result() {
        assert_eq!(
            stream("SELECT ?o WHERE { <nothing> <p> ?o }", MediaType::SparqlXml),
            xml_document(&["o"], "")
        );
    }

    #[test]
    fn test_binary_export_writes_raw_ids() {
        let index = index();
        let bytes = stream_bytes(&index, "SELECT ?p ?o WHERE { <s> ?p ?o }", MediaType::OctetStream);
        assert_eq!(bytes.len(), 4 * 2 * std::mem::size_of::<Id>());

        let ids: Vec<Id> = bytes
            .chunks_exact(8)
            .map(|raw| Id::from_le_bytes(raw.try_into().unwrap()))
            .collect();
        let mut rows: Vec<(&str, &str)> = ids
            .chunks_exact(2)
            .map(|row| (index.get_term(row[0]).unwrap(), index.get_term(row[1]).unwrap()))
            .collect();
        rows.sort_unstable();
        assert_eq!(
            rows,
            vec![
                ("<label>", "\"Some\\\"Where\tOver,\"@en-ca"),
                ("<node>", "_:b0"),
                ("<num>", "\"42\"^^<http://www.w3.org/2001/XMLSchema#int>"),
                ("<p>", "<http://example.org/o>"),
            ]
        );
    }

    #[test]
    fn test_binary_export_of_empty_result_is_empty() {
        let index = index();
        assert!(stream_bytes(&index, "SELECT ?o WHERE { <nothing> <p> ?o }", MediaType::OctetStream)
            .is_empty());
    }

    #[test]
    fn test_stream_is_chunked() {
        let triples: Vec<(String, String, String)> = (0..STREAM_CHUNK_ROWS + 5)
            .map(|i| (format!("<s{i}>"), "<p>".to_string(), "<o>".to_string()))
            .collect();
        let index = Arc::new(TripleIndex::from_triples(triples));
        let (planned, ctx) = plan(&index, "SELECT ?s WHERE { ?s <p> <o> }");
        let chunks: Vec<String> = compute_result_as_stream(&planned, &ctx, MediaType::Csv)
            .unwrap()
            .map(|chunk| String::from_utf8(chunk.unwrap()).unwrap())
            .collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "s\n");
        assert_eq!(chunks[2].lines().count(), 5);
    }

    #[test]
    fn test_cancelled_stream_ends_with_error() {
        let index = index();
        let (planned, ctx) = plan(&index, "SELECT ?o WHERE { <s> <p> ?o }");
        let mut chunks = compute_result_as_stream(&planned, &ctx, MediaType::Csv).unwrap();
        assert!(chunks.next().unwrap().is_ok());
        planned
            .tree
            .cancellation_handle()
            .unwrap()
            .cancel(CancellationReason::Manual);
        let err = chunks.next().unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert!(chunks.next().is_none());
    }

    #[test]
    fn test_qlever_json() {
        let index = index();
        let (planned, ctx) = plan(&index, "SELECT ?p ?o WHERE { <s> ?p ?o }");
        let json = compute_result_as_json(&planned, &ctx, Instant::now(), 2, MediaType::QleverJson).unwrap();
        assert_eq!(json["status"], "OK");
        assert_eq!(json["query"], "SELECT ?p ?o WHERE { <s> ?p ?o }");
        assert_eq!(json["resultsize"], 4);
        assert_eq!(json["selected"], serde_json::json!(["?p", "?o"]));
        assert_eq!(json["res"].as_array().unwrap().len(), 2);
        assert!(json["time"]["total"].as_str().unwrap().ends_with("ms"));
        assert_eq!(json["runtimeInformation"]["status"], "computed");
    }

    #[test]
    fn test_sparql_json_bindings() {
        let index = index();
        let (planned, ctx) = plan(&index, "SELECT ?p ?o WHERE { <s> ?p ?o }");
        let json =
            compute_result_as_json(&planned, &ctx, Instant::now(), 100, MediaType::SparqlJson).unwrap();
        assert_eq!(json["head"]["vars"], serde_json::json!(["p", "o"]));
        let bindings = json["results"]["bindings"].as_array().unwrap();
        assert_eq!(bindings.len(), 4);
        let object_of = |predicate: &str| {
            bindings
                .iter()
                .find(|b| b["p"]["value"] == predicate)
                .map(|b| b["o"].clone())
                .unwrap()
        };
        assert_eq!(
            object_of("p"),
            serde_json::json!({"type": "uri", "value": "http://example.org/o"})
        );
        assert_eq!(
            object_of("label"),
            serde_json::json!({"type": "literal", "value": "Some\"Where\tOver,", "xml:lang": "en-ca"})
        );
        assert_eq!(
            object_of("num"),
            serde_json::json!({
                "type": "literal",
                "value": "42",
                "datatype": "http://www.w3.org/2001/XMLSchema#int"
            })
        );
        assert_eq!(object_of("node"), serde_json::json!({"type": "bnode", "value": "b0"}));
    }

    #[test]
    fn test_json_rejects_stream_formats() {
        let index = index();
        let (planned, ctx) = plan(&index, "SELECT ?o WHERE { <s> <p> ?o }");
        assert!(compute_result_as_json(&planned, &ctx, Instant::now(), 10, MediaType::Csv).is_err());
        assert!(compute_result_as_stream(&planned, &ctx, MediaType::QleverJson).is_err());
    }
}

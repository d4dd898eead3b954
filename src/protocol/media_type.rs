//! Choosing the result format of a query request

use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use headers::HeaderMapExt;
use headers_accept::Accept;
use mediatype::names::{APPLICATION, CSV, JSON, TEXT};
use mediatype::{MediaType as MediaRange, Name};

use crate::engine::MediaType;
use crate::error::QueryError;

/// Accepted media types, in order of preference for `*/*`
static SUPPORTED: [MediaRange<'static>; 7] = [
    MediaRange::new(APPLICATION, Name::new_unchecked("qlever-results+json")),
    MediaRange::new(APPLICATION, Name::new_unchecked("sparql-results+json")),
    MediaRange::new(APPLICATION, Name::new_unchecked("sparql-results+xml")),
    MediaRange::new(TEXT, CSV),
    MediaRange::new(TEXT, Name::new_unchecked("tab-separated-values")),
    MediaRange::new(APPLICATION, Name::new_unchecked("octet-stream")),
    MediaRange::new(APPLICATION, JSON),
];

/// The export format for each entry of `SUPPORTED`
const FORMATS: [MediaType; 7] = [
    MediaType::QleverJson,
    MediaType::SparqlJson,
    MediaType::SparqlXml,
    MediaType::Csv,
    MediaType::Tsv,
    MediaType::OctetStream,
    MediaType::QleverJson,
];

pub fn supported_media_types() -> String {
    SUPPORTED
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// `action=..._export` wins over the `Accept` header. Without either the
/// native JSON format is used.
pub fn resolve_media_type(
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<MediaType, QueryError> {
    if let Some(format) = params.get("action").and_then(|a| MediaType::from_action(a)) {
        return Ok(format);
    }

    let raw = headers
        .get(header::ACCEPT)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default();
    if raw.trim().is_empty() {
        return Ok(MediaType::QleverJson);
    }

    let unsupported = || QueryError::UnsupportedMediaType {
        accept: raw.clone(),
        supported: supported_media_types(),
    };
    let accept = headers.typed_get::<Accept>().ok_or_else(unsupported)?;
    let negotiated = accept.negotiate(&SUPPORTED).ok_or_else(unsupported)?;
    SUPPORTED
        .iter()
        .position(|candidate| candidate == negotiated)
        .map(|i| FORMATS[i])
        .ok_or_else(unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn resolve(action: Option<&str>, accept: Option<&str>) -> Result<MediaType, QueryError> {
        let mut params = HashMap::new();
        if let Some(action) = action {
            params.insert("action".to_string(), action.to_string());
        }
        let mut headers = HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(header::ACCEPT, HeaderValue::from_str(accept).unwrap());
        }
        resolve_media_type(&params, &headers)
    }

    #[test]
    fn test_default_is_native_json() {
        assert_eq!(resolve(None, None).unwrap(), MediaType::QleverJson);
        assert_eq!(resolve(None, Some("*/*")).unwrap(), MediaType::QleverJson);
    }

    #[test]
    fn test_accept_header() {
        assert_eq!(resolve(None, Some("text/csv")).unwrap(), MediaType::Csv);
        assert_eq!(
            resolve(None, Some("text/tab-separated-values")).unwrap(),
            MediaType::Tsv
        );
        assert_eq!(
            resolve(None, Some("text/html;q=0.9, application/sparql-results+json")).unwrap(),
            MediaType::SparqlJson
        );
    }

    #[test]
    fn test_streamed_binary_formats() {
        assert_eq!(
            resolve(None, Some("application/sparql-results+xml")).unwrap(),
            MediaType::SparqlXml
        );
        assert_eq!(
            resolve(None, Some("application/octet-stream")).unwrap(),
            MediaType::OctetStream
        );
        assert_eq!(
            resolve(Some("binary_export"), Some("text/csv")).unwrap(),
            MediaType::OctetStream
        );
        let err = resolve(None, Some("image/png")).unwrap_err().to_string();
        assert!(err.contains("application/sparql-results+xml"));
        assert!(err.contains("application/octet-stream"));
    }

    #[test]
    fn test_action_beats_accept() {
        assert_eq!(
            resolve(Some("tsv_export"), Some("application/sparql-results+json")).unwrap(),
            MediaType::Tsv
        );
        // Unknown actions fall back to the header
        assert_eq!(resolve(Some("xml_export"), Some("text/csv")).unwrap(), MediaType::Csv);
    }

    #[test]
    fn test_unsupported_accept() {
        let err = resolve(None, Some("image/png")).unwrap_err();
        assert_eq!(err.status_code(), 400);
        let message = err.to_string();
        assert!(message.contains("\"image/png\""));
        assert!(message.contains("text/csv"));
    }
}

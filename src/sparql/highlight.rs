//! Terminal rendering of parse errors.
//!
//! Marks the offending span of a query with ANSI colors for log output and
//! the server console. Rendering is best effort: metadata that does not fit
//! the query yields the plain query with a note instead of an error.

use crate::error::ParseMetadata;

const RESET: &str = "\x1b[0m";
const ERROR_COLOR: &str = "\x1b[1;4;31m"; // bold underlined red

/// The query with `start_index..=stop_index` highlighted
pub fn colored_error(metadata: &ParseMetadata) -> String {
    match try_colored_error(metadata) {
        Some(colored) => colored,
        None => format!(
            "{}\n(The position of the error could not be highlighted)",
            metadata.query
        ),
    }
}

/// `None` if the metadata does not describe a span of the query
pub fn try_colored_error(metadata: &ParseMetadata) -> Option<String> {
    let query = metadata.query.as_str();
    let start = metadata.start_index;
    let end = metadata.stop_index.checked_add(1)?.min(query.len());
    if start > end {
        return None;
    }
    let before = query.get(..start)?;
    let marked = query.get(start..end)?;
    let after = query.get(end..)?;

    let mut result = String::with_capacity(query.len() + ERROR_COLOR.len() + RESET.len());
    result.push_str(before);
    if marked.is_empty() {
        // Error at the very end: mark an empty spot
        result.push_str(ERROR_COLOR);
        result.push(' ');
        result.push_str(RESET);
    } else {
        result.push_str(ERROR_COLOR);
        result.push_str(marked);
        result.push_str(RESET);
    }
    result.push_str(after);
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(query: &str, start: usize, stop: usize) -> ParseMetadata {
        ParseMetadata {
            start_index: start,
            stop_index: stop,
            line: 1,
            position_in_line: start,
            query: query.to_string(),
        }
    }

    #[test]
    fn test_marks_span() {
        let colored = colored_error(&metadata("SELECT * { x }", 11, 11));
        assert_eq!(colored, format!("SELECT * {{ {ERROR_COLOR}x{RESET} }}"));
    }

    #[test]
    fn test_error_at_end() {
        let colored = colored_error(&metadata("SELECT", 6, 6));
        assert!(colored.starts_with("SELECT"));
        assert!(colored.contains(ERROR_COLOR));
    }

    #[test]
    fn test_bad_metadata_degrades_to_raw_query() {
        let colored = colored_error(&metadata("SELECT", 40, 50));
        assert!(colored.starts_with("SELECT\n"));
        assert!(colored.contains("could not be highlighted"));
    }

    #[test]
    fn test_non_char_boundary_degrades() {
        // 'ä' is two bytes; index 1 splits it
        let colored = colored_error(&metadata("ä", 1, 1));
        assert!(colored.contains("could not be highlighted"));
    }
}

//! Error taxonomy for the query-serving pipeline
//!
//! Every failure a request can run into ends up as a [`QueryError`]. The enum
//! is `Clone` so that a failed cache computation can be handed to every caller
//! that joined it.

use serde::Serialize;

use crate::execution::{CancellationError, CancellationReason};

/// Position of a parse error inside the query text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseMetadata {
    /// Byte offset of the first offending character
    pub start_index: usize,
    /// Byte offset of the last offending character (inclusive)
    pub stop_index: usize,
    /// 1-based line
    pub line: usize,
    /// 0-based column within `line`
    pub position_in_line: usize,
    /// The query, with the offending span highlighted when possible
    pub query: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("{message}")]
    Parse {
        message: String,
        metadata: Option<ParseMetadata>,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("Query id '{0}' is already in use!")]
    QueryIdInUse(String),

    #[error(
        "Did not find any supported media type in this 'Accept:' header field: \"{accept}\". \
         Supported media types are: {supported}"
    )]
    UnsupportedMediaType { accept: String, supported: String },

    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    #[error("Tried to allocate {requested} bytes, but only {available} bytes are available")]
    MemoryLimitExceeded { requested: usize, available: usize },

    #[error("Unknown path")]
    NotFound,

    #[error("{0}")]
    Internal(String),
}

impl QueryError {
    pub fn internal(message: impl Into<String>) -> Self {
        QueryError::Internal(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        QueryError::BadRequest(message.into())
    }

    /// HTTP status class this error is reported with
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::Parse { .. }
            | QueryError::BadRequest(_)
            | QueryError::UnsupportedMediaType { .. } => 400,
            QueryError::AccessDenied(_) => 403,
            QueryError::NotFound => 404,
            QueryError::QueryIdInUse(_) => 409,
            QueryError::Cancelled(e) => match e.reason {
                CancellationReason::Timeout => 429,
                CancellationReason::Manual => 503,
            },
            QueryError::MemoryLimitExceeded { .. } | QueryError::Internal(_) => 500,
        }
    }

    pub fn parse_metadata(&self) -> Option<&ParseMetadata> {
        match self {
            QueryError::Parse { metadata, .. } => metadata.as_ref(),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

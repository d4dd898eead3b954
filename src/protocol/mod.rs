//! Client-server surface
//!
//! - `server` - the transport independent request dispatcher
//! - `media_type` - choosing the result format of a query
//! - `rest` - the HTTP and WebSocket front end

pub mod media_type;
pub mod rest;
pub mod server;

pub use server::{ResponseBody, Server, ServerRequest, ServerResponse, QUERY_ID_HEADER};

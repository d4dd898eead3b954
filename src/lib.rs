//! # triplegate
//!
//! A SPARQL query server over an in-memory triple index.
//!
//! ## Request path
//! ```text
//! HTTP request (axum)
//!     ↓
//! [protocol::server]        access token, admin commands, runtime parameters
//!     ↓
//! [registry]                query id lease + cancellation handle
//!     ↓
//! [sparql]                  parse   ─┐
//! [engine::planner]         plan     ├─ worker pool (rayon)
//! [engine::tree]            execute ─┘   results shared through the cache
//!     ↓
//! [engine::export]          JSON document or streamed CSV/TSV
//! ```
//!
//! While a query runs, the runtime information of its operation tree is
//! published through the [`hub`] and can be followed on `/watch/:query_id`.
//!
//! ## Usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use triplegate::{protocol::rest, Config, Server};
//!
//! let config = Config::load()?;
//! let server = Arc::new(Server::from_config(config.clone())?);
//! rest::start_http_server(server, &config).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod hub;
pub mod index;
pub mod parameters;
pub mod protocol;
pub mod registry;
pub mod sparql;
pub mod units;

pub use config::Config;
pub use error::{QueryError, QueryResult};
pub use protocol::Server;

//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (TRIPLEGATE_* prefix)
//!
//! Every section has defaults, so all files are optional.
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [server]
//! port = 7001
//! num_threads = 8
//! access_token = "secret"
//!
//! [cache]
//! max_size = "8 GB"
//!
//! [query]
//! default_timeout = "30s"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! TRIPLEGATE_SERVER__PORT=7002
//! TRIPLEGATE_CACHE__MAX_NUM_ENTRIES=500
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::execution::{CacheLimits, MAKE_ROOM_SLACK_FACTOR};
use crate::units::{MemorySize, TimeLimit};

/// Upper bound on rows in a JSON response unless the request asks for fewer
pub const MAX_NOF_ROWS_IN_RESULT: usize = 1_000_000;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Listener and worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of concurrently executing queries.
    /// 0 = one per CPU core
    #[serde(default)]
    pub num_threads: usize,

    /// Token for administrative commands. Without one they are refused.
    #[serde(default)]
    pub access_token: Option<String>,
}

/// The triple index to serve
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    /// N-Triples style file loaded at startup (empty index if unset)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Display name of the knowledge base
    #[serde(default)]
    pub name: String,

    /// Display name of the text index
    #[serde(default)]
    pub text_name: String,
}

/// Result cache bounds; all of them can be changed at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_num_entries")]
    pub max_num_entries: usize,

    /// Total size of unpinned entries
    #[serde(default = "default_cache_max_size")]
    pub max_size: MemorySize,

    /// Larger results are never cached
    #[serde(default = "default_cache_max_size_single_entry")]
    pub max_size_single_entry: MemorySize,
}

/// Memory shared by the intermediate results of all queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_memory")]
    pub max_memory: MemorySize,

    /// On memory pressure the cache is asked to free this multiple of the
    /// requested amount
    #[serde(default = "default_make_room_slack_factor")]
    pub make_room_slack_factor: usize,
}

/// Query execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Applied when a request has no `timeout`. Only requests with a valid
    /// access token may ask for more.
    #[serde(default = "default_query_timeout")]
    pub default_timeout: TimeLimit,

    /// Answer `SELECT DISTINCT ?p WHERE { ?s ?p ?o }` from the predicate list
    #[serde(default = "default_true")]
    pub enable_pattern_trick: bool,

    /// Row cap for JSON responses
    #[serde(default = "default_max_send_rows")]
    pub max_send_rows: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file; stderr if unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Allowed CORS origins, used when `cors_allow_all` is false
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Allow every origin (SPARQL endpoints are usually public)
    #[serde(default = "default_true")]
    pub cors_allow_all: bool,

    /// Interval between websocket pings on idle `/watch` connections, in
    /// milliseconds. 0 = disabled.
    #[serde(default = "default_ws_ping_interval_ms")]
    pub ws_ping_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7001
}
fn default_cache_max_num_entries() -> usize {
    1000
}
fn default_cache_max_size() -> MemorySize {
    MemorySize::gigabytes(30)
}
fn default_cache_max_size_single_entry() -> MemorySize {
    MemorySize::gigabytes(5)
}
fn default_max_memory() -> MemorySize {
    MemorySize::gigabytes(4)
}
fn default_make_room_slack_factor() -> usize {
    MAKE_ROOM_SLACK_FACTOR
}
fn default_query_timeout() -> TimeLimit {
    TimeLimit::from_secs(30)
}
fn default_max_send_rows() -> usize {
    MAX_NOF_ROWS_IN_RESULT
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_ws_ping_interval_ms() -> u64 {
    30_000
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (TRIPLEGATE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("TRIPLEGATE_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TRIPLEGATE_").split("__"))
            .extract()
    }

    /// Number of worker threads after resolving 0 to the CPU count
    pub fn effective_num_threads(&self) -> usize {
        if self.server.num_threads == 0 {
            num_cpus::get()
        } else {
            self.server.num_threads
        }
    }

    pub fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            max_num_entries: self.cache.max_num_entries,
            max_size: self.cache.max_size.as_usize(),
            max_size_single_entry: self.cache.max_size_single_entry.as_usize(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            num_threads: 0,
            access_token: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_num_entries: default_cache_max_num_entries(),
            max_size: default_cache_max_size(),
            max_size_single_entry: default_cache_max_size_single_entry(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            max_memory: default_max_memory(),
            make_room_slack_factor: default_make_room_slack_factor(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            default_timeout: default_query_timeout(),
            enable_pattern_trick: true,
            max_send_rows: default_max_send_rows(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            cors_origins: Vec::new(),
            cors_allow_all: true,
            ws_ping_interval_ms: default_ws_ping_interval_ms(),
        }
    }
}

//! Request dispatcher
//!
//! [`Server::process`] turns one request (path, URL parameters, headers) into
//! exactly one response. Administrative parameters are applied in a fixed
//! order and the response of the last one processed is returned. A `query`
//! parameter is always handled last and its response replaces all others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::engine::{
    compute_result_as_json, compute_result_as_stream, MediaType, PlannedQuery,
    QueryExecutionContext, QueryPlanner, QueryResultCache, StreamableResult,
};
use crate::error::QueryError;
use crate::execution::{AllocationBudget, CancellationHandle, CancellationReason, WorkerPool};
use crate::hub::{MessageSender, QueryHub};
use crate::index::TripleIndex;
use crate::parameters::{
    ParameterValue, RuntimeParameters, CACHE_MAX_NUM_ENTRIES, CACHE_MAX_SIZE,
    CACHE_MAX_SIZE_SINGLE_ENTRY,
};
use crate::registry::{OwningQueryId, QueryId, QueryRegistry};
use crate::sparql::highlight::try_colored_error;
use crate::sparql::parse_query;
use crate::units::TimeLimit;

use super::media_type::resolve_media_type;

/// Header carrying a client-chosen query id
pub const QUERY_ID_HEADER: &str = "Query-Id";

const PING_RESPONSE: &str = "This server is up and running\n";

/// Commands that need a valid access token
const GATED_COMMANDS: [&str; 3] = ["clear-cache-complete", "dump-active-queries", "cancel-query"];

/// Parameters that change server state and need a valid access token
const GATED_PARAMETERS: [&str; 2] = ["index-description", "text-description"];

/// One request, independent of the transport it arrived on
#[derive(Debug, Clone, Default)]
pub struct ServerRequest {
    pub path: String,
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
}

impl ServerRequest {
    pub fn new(path: impl Into<String>, params: HashMap<String, String>) -> Self {
        ServerRequest {
            path: path.into(),
            params,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A streamed body ends with its first error, after which no chunk follows
pub enum ResponseBody {
    Full(String),
    Stream(BoxStream<'static, Result<Vec<u8>, QueryError>>),
}

pub struct ServerResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: ResponseBody,
}

impl ServerResponse {
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        ServerResponse {
            status,
            content_type: "text/plain",
            body: ResponseBody::Full(message.into()),
        }
    }

    pub fn json(status: StatusCode, value: &Value) -> Self {
        ServerResponse {
            status,
            content_type: "application/json",
            body: ResponseBody::Full(value.to_string()),
        }
    }

    fn serialized<T: Serialize>(value: &T) -> Result<Self, QueryError> {
        let body = serde_json::to_string(value)
            .map_err(|e| QueryError::internal(format!("Could not serialize response: {e}")))?;
        Ok(ServerResponse {
            status: StatusCode::OK,
            content_type: "application/json",
            body: ResponseBody::Full(body),
        })
    }

    fn error(e: &QueryError) -> Self {
        ServerResponse::text(status_of(e), e.to_string())
    }

    /// The body of a non-streamed response
    pub fn body_text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Full(body) => Some(body),
            ResponseBody::Stream(_) => None,
        }
    }

    pub fn is_streamed(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }
}

impl std::fmt::Debug for ServerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("streamed", &self.is_streamed())
            .finish()
    }
}

fn status_of(e: &QueryError) -> StatusCode {
    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn format_millis(since: Instant) -> String {
    format!("{}ms", since.elapsed().as_millis())
}

/// Compare without exiting early on the first differing byte
fn tokens_match(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// =============================================================================
// Guards of a running query
// =============================================================================

/// Keeps the timeout timer of a running query armed. Dropping it before
/// [`QueryGuard::finish`] (a failed query, a client that went away) cancels
/// the query.
struct QueryGuard {
    handle: Arc<CancellationHandle>,
    timer: tokio::task::JoinHandle<()>,
    query_id: QueryId,
    finished: bool,
}

impl QueryGuard {
    fn arm(handle: Arc<CancellationHandle>, query_id: QueryId, limit: TimeLimit) -> Self {
        let weak = Arc::downgrade(&handle);
        let timer_id = query_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(limit.duration()).await;
            if let Some(handle) = weak.upgrade() {
                tracing::info!(query_id = %timer_id, timeout = %limit, "query_timed_out");
                handle.cancel(CancellationReason::Timeout);
            }
        });
        QueryGuard {
            handle,
            timer,
            query_id,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        self.timer.abort();
        if !self.finished && !self.handle.is_cancelled() {
            tracing::debug!(query_id = %self.query_id, "query_abandoned");
            self.handle.cancel(CancellationReason::Manual);
        }
    }
}

/// Streamed body that owns everything the query needs until the last chunk
/// has been produced: the id lease, the progress sender and the timer.
struct GuardedChunks {
    chunks: StreamableResult,
    guard: Option<QueryGuard>,
    failed: bool,
    request_timer: Instant,
    _planned: Arc<PlannedQuery>,
    _sender: Arc<MessageSender>,
}

impl Iterator for GuardedChunks {
    type Item = Result<Vec<u8>, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.chunks.next() {
            Some(Ok(chunk)) => Some(Ok(chunk)),
            Some(Err(e)) => {
                let query_id = self.guard.as_ref().map(|g| g.query_id.to_string());
                tracing::error!(
                    query_id = query_id.as_deref().unwrap_or_default(),
                    error = %e,
                    "stream_export_failed"
                );
                self.failed = true;
                Some(Err(e))
            }
            None => {
                if let Some(guard) = self.guard.take() {
                    if !self.failed {
                        tracing::info!(
                            query_id = %guard.query_id,
                            total_ms = self.request_timer.elapsed().as_millis() as u64,
                            "query_done"
                        );
                        guard.finish();
                    }
                }
                None
            }
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Everything a request needs: the index, the shared cache and memory budget,
/// the query registry, the progress hub and the worker pool.
pub struct Server {
    config: Config,
    index: Arc<TripleIndex>,
    cache: Arc<QueryResultCache>,
    budget: Arc<AllocationBudget>,
    registry: QueryRegistry,
    hub: QueryHub,
    pool: WorkerPool,
    parameters: Arc<RuntimeParameters>,
    access_token: Option<String>,
    started: Instant,
}

impl Server {
    /// Must be called from within a tokio runtime; the query hub spawns its
    /// task on it.
    pub fn new(config: Config, index: TripleIndex) -> Result<Self, QueryError> {
        index.set_kb_name(&config.index.name);
        index.set_text_name(&config.index.text_name);
        let index = Arc::new(index);

        let cache = Arc::new(QueryResultCache::new(config.cache_limits()));
        let budget = Arc::new(AllocationBudget::with_slack_factor(
            config.memory.max_memory.as_usize(),
            config.memory.make_room_slack_factor,
        ));
        let weak_cache = Arc::downgrade(&cache);
        budget.set_pressure_callback(Arc::new(move |bytes| {
            weak_cache
                .upgrade()
                .map_or(0, |cache| cache.make_room_as_much_as_possible(bytes))
        }));

        let parameters = Arc::new(RuntimeParameters::from_config(&config));
        wire_cache_parameters(&parameters, &cache)?;

        let pool = WorkerPool::new(config.server.num_threads)?;
        let access_token = config
            .server
            .access_token
            .clone()
            .filter(|token| !token.is_empty());
        if access_token.is_none() {
            tracing::info!("no_access_token_configured");
        }

        tracing::info!(
            num_triples = index.num_triples(),
            num_threads = pool.num_threads(),
            "server_initialized"
        );
        Ok(Server {
            config,
            index,
            cache,
            budget,
            registry: QueryRegistry::new(),
            hub: QueryHub::new(),
            pool,
            parameters,
            access_token,
            started: Instant::now(),
        })
    }

    /// Load the index named in the config, or start with an empty one
    pub fn from_config(config: Config) -> Result<Self, QueryError> {
        let index = match &config.index.path {
            Some(path) => {
                let timer = Instant::now();
                let index = TripleIndex::load(path).map_err(|e| QueryError::internal(e.to_string()))?;
                tracing::info!(
                    path = %path.display(),
                    num_triples = index.num_triples(),
                    load_ms = timer.elapsed().as_millis() as u64,
                    "index_loaded"
                );
                index
            }
            None => {
                tracing::warn!("no_index_configured");
                TripleIndex::empty()
            }
        };
        Self::new(config, index)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<TripleIndex> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<QueryResultCache> {
        &self.cache
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &QueryHub {
        &self.hub
    }

    pub fn parameters(&self) -> &RuntimeParameters {
        &self.parameters
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Answer one request. Never fails: errors become error responses.
    pub async fn process(&self, request: ServerRequest) -> ServerResponse {
        let request_timer = Instant::now();
        tracing::debug!(path = %request.path, num_params = request.params.len(), "request_received");
        match self.dispatch(request, request_timer).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(status = e.status_code(), error = %e, "request_failed");
                ServerResponse::error(&e)
            }
        }
    }

    async fn dispatch(
        &self,
        request: ServerRequest,
        request_timer: Instant,
    ) -> Result<ServerResponse, QueryError> {
        let ServerRequest {
            path,
            params,
            headers,
        } = request;

        let token_valid = self.check_access_token(params.get("access-token").map(String::as_str))?;
        if !token_valid {
            self.check_gated_parameters(&params)?;
        }

        let mut response = None;

        if let Some(cmd) = params.get("cmd") {
            if let Some(r) = self.process_command(cmd, &params)? {
                response = Some(r);
            }
        }

        if path == "/ping" {
            let msg = params.get("msg").map_or("", String::as_str);
            tracing::info!(msg, "ping");
            response = Some(ServerResponse::text(StatusCode::OK, PING_RESPONSE));
        }

        if let Some(description) = params.get("index-description") {
            self.index.set_kb_name(description);
            tracing::info!(name = %description, "index_description_set");
            response = Some(ServerResponse::serialized(&self.index.stats())?);
        }

        if let Some(description) = params.get("text-description") {
            self.index.set_text_name(description);
            tracing::info!(name = %description, "text_description_set");
            response = Some(ServerResponse::serialized(&self.index.stats())?);
        }

        for key in self.parameters.get_keys() {
            if let Some(value) = params.get(key) {
                self.parameters.set(key, value)?;
                response = Some(ServerResponse::serialized(&self.parameters.to_map())?);
            }
        }

        if let Some(query) = params.get("query") {
            if query.is_empty() {
                return Err(QueryError::bad_request(
                    "Parameter \"query\" must not have an empty value",
                ));
            }
            let time_limit = self.verify_timeout(params.get("timeout"), token_valid)?;
            return Ok(self
                .process_query(query, &params, &headers, request_timer, time_limit)
                .await);
        }

        match response {
            Some(response) => Ok(response),
            None if !params.is_empty() => Err(QueryError::bad_request(
                "Request with URL parameters, but none of them could be processed",
            )),
            None => Err(QueryError::NotFound),
        }
    }

    /// `Ok(true)` for a correct token, `Ok(false)` if none was sent
    fn check_access_token(&self, provided: Option<&str>) -> Result<bool, QueryError> {
        let Some(provided) = provided else {
            return Ok(false);
        };
        match &self.access_token {
            None => Err(QueryError::AccessDenied(
                "Access token was provided but server was started without an access token, \
                 request is ignored"
                    .to_string(),
            )),
            Some(expected) if tokens_match(provided, expected) => Ok(true),
            Some(_) => Err(QueryError::AccessDenied(
                "Access token was provided but not correct, request is ignored".to_string(),
            )),
        }
    }

    /// Reject the whole request if any gated parameter is present. Runs
    /// before any parameter takes effect.
    fn check_gated_parameters(&self, params: &HashMap<String, String>) -> Result<(), QueryError> {
        let mut gated: Vec<(&str, &str)> = Vec::new();
        if let Some(cmd) = params.get("cmd") {
            if GATED_COMMANDS.contains(&cmd.as_str()) {
                gated.push(("cmd", cmd.as_str()));
            }
        }
        let keys = GATED_PARAMETERS
            .into_iter()
            .chain(self.parameters.get_keys());
        for key in keys {
            if let Some(value) = params.get(key) {
                gated.push((key, value.as_str()));
            }
        }

        let Some((key, value)) = gated.first() else {
            return Ok(());
        };
        let reason = if self.access_token.is_none() {
            "requires a valid access token, but no access token configured"
        } else {
            "requires a valid access token"
        };
        Err(QueryError::AccessDenied(format!(
            "Access to \"{key}={value}\" denied ({reason}), processing of request aborted"
        )))
    }

    /// `Ok(None)` for an unknown command
    fn process_command(
        &self,
        cmd: &str,
        params: &HashMap<String, String>,
    ) -> Result<Option<ServerResponse>, QueryError> {
        let response = match cmd {
            "stats" => ServerResponse::serialized(&self.index.stats())?,
            "cache-stats" => ServerResponse::serialized(&self.cache.stats())?,
            "clear-cache" => {
                self.cache.clear_unpinned_only();
                ServerResponse::serialized(&self.cache.stats())?
            }
            "clear-cache-complete" => {
                self.cache.clear_all();
                ServerResponse::serialized(&self.cache.stats())?
            }
            "get-settings" => ServerResponse::serialized(&self.parameters.to_map())?,
            "dump-active-queries" => {
                let active: Vec<_> = self.registry.get_active_queries().collect();
                ServerResponse::serialized(&active)?
            }
            "cancel-query" => {
                let id = params
                    .get("cancel-query-id")
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        QueryError::bad_request(
                            "Command \"cancel-query\" requires a non-empty \"cancel-query-id\"",
                        )
                    })?;
                let cancelled = self
                    .registry
                    .cancel(&QueryId::new(id.as_str()), CancellationReason::Manual);
                tracing::info!(query_id = %id, cancelled, "cancel_requested");
                ServerResponse::json(
                    StatusCode::OK,
                    &json!({ "query-id": id, "cancelled": cancelled }),
                )
            }
            _ => {
                tracing::debug!(cmd, "unknown_command");
                return Ok(None);
            }
        };
        tracing::info!(cmd, "command_processed");
        Ok(Some(response))
    }

    /// A timeout above the default needs a valid access token
    fn verify_timeout(
        &self,
        requested: Option<&String>,
        token_valid: bool,
    ) -> Result<TimeLimit, QueryError> {
        let default = self.parameters.default_query_timeout();
        let Some(requested) = requested else {
            return Ok(default);
        };
        let limit = TimeLimit::parse(requested).map_err(|e| {
            QueryError::bad_request(format!("Could not parse timeout \"{requested}\": {e}"))
        })?;
        if limit > default && !token_valid {
            return Err(QueryError::AccessDenied(format!(
                "User submitted timeout was higher than what is currently allowed by this \
                 instance ({default}). Please use a valid-access token to override this server \
                 configuration."
            )));
        }
        Ok(limit)
    }

    fn query_id_for(&self, headers: &HeaderMap, query: &str) -> Result<OwningQueryId, QueryError> {
        let requested = headers
            .get(QUERY_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match requested {
            Some(token) => self.registry.unique_id_from_string(token, query),
            None => Ok(self.registry.unique_id(query)),
        }
    }

    async fn process_query(
        &self,
        query: &str,
        params: &HashMap<String, String>,
        headers: &HeaderMap,
        request_timer: Instant,
        time_limit: TimeLimit,
    ) -> ServerResponse {
        let mut planned = None;
        match self
            .run_query(query, params, headers, request_timer, time_limit, &mut planned)
            .await
        {
            Ok(response) => response,
            Err(e) => query_error_response(query, &e, request_timer, planned.as_deref()),
        }
    }

    async fn run_query(
        &self,
        query: &str,
        params: &HashMap<String, String>,
        headers: &HeaderMap,
        request_timer: Instant,
        time_limit: TimeLimit,
        planned_slot: &mut Option<Arc<PlannedQuery>>,
    ) -> Result<ServerResponse, QueryError> {
        let max_send = match params.get("send") {
            Some(send) => send.trim().parse::<usize>().map_err(|e| {
                QueryError::bad_request(format!("Could not parse \"send={send}\": {e}"))
            })?,
            None => self.config.query.max_send_rows,
        };
        let pin_subtrees = params.get("pinsubtrees").is_some_and(|v| v == "true");
        let pin_result = params.get("pinresult").is_some_and(|v| v == "true");
        let format = resolve_media_type(params, headers)?;

        let owning_id = self.query_id_for(headers, query)?;
        let sender = Arc::new(MessageSender::create(owning_id, &self.hub).await?);
        let query_id = sender.query_id().clone();
        tracing::info!(
            query_id = %query_id,
            media_type = %format,
            timeout = %time_limit,
            pin_subtrees,
            pin_result,
            "processing_query"
        );

        let planned = Arc::new(self.parse_and_plan(query.to_string()).await?);
        *planned_slot = Some(Arc::clone(&planned));

        let handle = self.registry.get_cancellation_handle(&query_id).ok_or_else(|| {
            QueryError::internal(format!("No cancellation handle for active query {query_id}"))
        })?;
        handle.start_watch_dog();
        planned.tree.recursively_set_cancellation_handle(&handle);
        if let Some(deadline) = Instant::now().checked_add(time_limit.duration()) {
            planned.tree.recursively_set_time_constraint(deadline);
        }
        let guard = QueryGuard::arm(Arc::clone(&handle), query_id.clone(), time_limit);
        tracing::info!(
            query_id = %query_id,
            planning_ms = request_timer.elapsed().as_millis() as u64,
            "query_planned"
        );

        let ctx = QueryExecutionContext::new(
            Arc::clone(&self.index),
            Arc::clone(&self.cache),
            Arc::clone(&self.budget),
        )
        .with_pinning(pin_subtrees, pin_result)
        .with_progress(Arc::clone(&sender), &planned.tree);

        if format.is_streamed() {
            let job_planned = Arc::clone(&planned);
            let chunks = self
                .pool
                .compute(move || {
                    handle.reset_watch_dog_state();
                    compute_result_as_stream(&job_planned, &ctx, format)
                })
                .await?;
            let guarded = GuardedChunks {
                chunks,
                guard: Some(guard),
                failed: false,
                request_timer,
                _planned: planned,
                _sender: sender,
            };
            return Ok(ServerResponse {
                status: StatusCode::OK,
                content_type: format.content_type(),
                body: ResponseBody::Stream(stream::iter(guarded).boxed()),
            });
        }

        let job_planned = Arc::clone(&planned);
        let body = self
            .pool
            .compute(move || {
                compute_result_as_json(&job_planned, &ctx, request_timer, max_send, format)
            })
            .await?;
        guard.finish();
        tracing::info!(
            query_id = %query_id,
            total_ms = request_timer.elapsed().as_millis() as u64,
            "query_done"
        );
        Ok(ServerResponse {
            status: StatusCode::OK,
            content_type: format.content_type(),
            body: ResponseBody::Full(body.to_string()),
        })
    }

    async fn parse_and_plan(&self, query: String) -> Result<PlannedQuery, QueryError> {
        let index = Arc::clone(&self.index);
        let enable_pattern_trick = self.config.query.enable_pattern_trick;
        self.pool
            .compute(move || {
                let parsed = parse_query(&query)?;
                let mut planner = QueryPlanner::new(index);
                planner.set_enable_pattern_trick(enable_pattern_trick);
                let tree = planner.create_execution_tree(&parsed)?;
                Ok(PlannedQuery { parsed, tree })
            })
            .await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("num_triples", &self.index.num_triples())
            .field("active_queries", &self.registry.num_active())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn wire_cache_parameters(
    parameters: &RuntimeParameters,
    cache: &Arc<QueryResultCache>,
) -> Result<(), QueryError> {
    let target = Arc::clone(cache);
    parameters.set_on_update_action(
        CACHE_MAX_NUM_ENTRIES,
        Arc::new(move |value| {
            if let ParameterValue::Count(n) = value {
                target.set_max_num_entries(n);
            }
        }),
    )?;
    let target = Arc::clone(cache);
    parameters.set_on_update_action(
        CACHE_MAX_SIZE,
        Arc::new(move |value| {
            if let ParameterValue::Memory(size) = value {
                target.set_max_size(size.as_usize());
            }
        }),
    )?;
    let target = Arc::clone(cache);
    parameters.set_on_update_action(
        CACHE_MAX_SIZE_SINGLE_ENTRY,
        Arc::new(move |value| {
            if let ParameterValue::Memory(size) = value {
                target.set_max_size_single_entry(size.as_usize());
            }
        }),
    )?;
    Ok(())
}

fn query_error_response(
    query: &str,
    e: &QueryError,
    request_timer: Instant,
    planned: Option<&PlannedQuery>,
) -> ServerResponse {
    let mut exception = e.to_string();
    tracing::error!(status = e.status_code(), error = %e, "query_failed");
    if let Some(metadata) = e.parse_metadata() {
        match try_colored_error(metadata) {
            Some(colored) => tracing::error!("{colored}"),
            None => {
                exception.push_str(" Highlighting an error for the command line log failed.");
                tracing::error!(query = %metadata.query, "error_highlighting_failed");
            }
        }
    }

    let elapsed = format_millis(request_timer);
    let mut body = json!({
        "query": query,
        "status": "ERROR",
        "resultsize": 0,
        "time": { "total": elapsed, "computeResult": elapsed },
        "exception": exception,
    });
    if let Some(metadata) = e.parse_metadata() {
        body["metadata"] = json!(metadata);
    }
    if let Some(planned) = planned {
        body["runtimeInformation"] = json!(planned.tree.runtime_information());
    }
    ServerResponse::json(status_of(e), &body)
}

//! HTTP front end
//!
//! Translates HTTP requests into [`ServerRequest`]s for the dispatcher and
//! serves the `/watch/:query_id` WebSocket that streams the runtime
//! information of a running query.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path,
    },
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{Config, HttpConfig};
use crate::error::QueryError;
use crate::hub::QueryToSocketDistributor;
use crate::protocol::server::{ResponseBody, Server, ServerRequest, ServerResponse};
use crate::registry::QueryId;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const SPARQL_QUERY: &str = "application/sparql-query";

/// `None` disables pings on `/watch` connections
#[derive(Clone, Copy)]
struct PingInterval(Option<Duration>);

impl IntoResponse for ServerResponse {
    fn into_response(self) -> Response {
        let content_type = [(header::CONTENT_TYPE, self.content_type)];
        match self.body {
            ResponseBody::Full(body) => (self.status, content_type, body).into_response(),
            ResponseBody::Stream(chunks) => {
                let bytes = chunks.map(|chunk| {
                    chunk
                        .map(Bytes::from)
                        .map_err(|e| std::io::Error::other(e.to_string()))
                });
                (self.status, content_type, Body::from_stream(bytes)).into_response()
            }
        }
    }
}

/// URL parameters; a repeated key keeps its last value
fn parse_params(raw: Option<&str>) -> Result<HashMap<String, String>, QueryError> {
    let Some(raw) = raw.filter(|raw| !raw.is_empty()) else {
        return Ok(HashMap::new());
    };
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw)
        .map_err(|e| QueryError::bad_request(format!("Could not parse URL parameters: {e}")))?;
    Ok(pairs.into_iter().collect())
}

/// Merge the parameters carried by a POST body into `params`
fn merge_post_body(
    headers: &HeaderMap,
    body: &[u8],
    params: &mut HashMap<String, String>,
) -> Result<(), QueryError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        FORM_URLENCODED => {
            let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body).map_err(|e| {
                QueryError::bad_request(format!("Could not parse the request body: {e}"))
            })?;
            params.extend(pairs);
            Ok(())
        }
        SPARQL_QUERY => {
            let query = std::str::from_utf8(body).map_err(|e| {
                QueryError::bad_request(format!("The query in the request body is not UTF-8: {e}"))
            })?;
            params.insert("query".to_string(), query.to_string());
            Ok(())
        }
        _ => Err(QueryError::bad_request(format!(
            "POST request with content type \"{content_type}\" not supported \
             (must be \"{FORM_URLENCODED}\" or \"{SPARQL_QUERY}\")"
        ))),
    }
}

fn to_server_request(
    method: &Method,
    uri: &Uri,
    headers: HeaderMap,
    body: &[u8],
) -> Result<ServerRequest, QueryError> {
    let mut params = parse_params(uri.query())?;
    if method == Method::POST {
        merge_post_body(&headers, body, &mut params)?;
    } else if method != Method::GET {
        return Err(QueryError::bad_request(format!(
            "Request method \"{method}\" not supported (has to be GET or POST)"
        )));
    }
    Ok(ServerRequest::new(uri.path(), params).with_headers(headers))
}

/// Every SPARQL and administrative request
async fn handle_request(
    Extension(server): Extension<Arc<Server>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match to_server_request(&method, &uri, headers, &body) {
        Ok(request) => server.process(request).await.into_response(),
        Err(e) => {
            tracing::warn!(method = %method, path = uri.path(), error = %e, "malformed_request");
            (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST),
                e.to_string(),
            )
                .into_response()
        }
    }
}

async fn health(Extension(server): Extension<Arc<Server>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": server.uptime_secs(),
        "active_queries": server.registry().num_active(),
    }))
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Stream the runtime information updates of `query_id`. Observers may
/// connect before the query starts; updates sent earlier are replayed.
async fn watch_query(
    Extension(server): Extension<Arc<Server>>,
    Extension(PingInterval(ping_interval)): Extension<PingInterval>,
    Path(query_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let id = QueryId::new(query_id);
    match server.hub().create_or_acquire_distributor_for_receiving(&id).await {
        Ok(distributor) => ws
            .on_upgrade(move |socket| stream_updates(socket, distributor, ping_interval))
            .into_response(),
        Err(e) => {
            tracing::error!(query_id = %id, error = %e, "watch_failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn stream_updates(
    socket: WebSocket,
    distributor: Arc<QueryToSocketDistributor>,
    ping_interval: Option<Duration>,
) {
    let query_id = distributor.query_id().clone();
    tracing::debug!(query_id = %query_id, "watch_connected");
    let (mut sender, mut receiver) = socket.split();

    let pings_enabled = ping_interval.is_some();
    let mut heartbeat =
        tokio::time::interval(ping_interval.unwrap_or(Duration::from_secs(3600)));
    heartbeat.tick().await; // the first tick completes immediately

    let mut next = 0;
    loop {
        tokio::select! {
            update = distributor.wait_for_next_data_piece(next) => {
                let Some(payload) = update else {
                    break;
                };
                next += 1;
                if sender.send(Message::Text(payload.as_str().to_owned())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick(), if pings_enabled => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    tracing::debug!(query_id = %query_id, updates_sent = next, "watch_closed");
}

/// Creates the Axum router
pub fn create_router(server: Arc<Server>, config: &HttpConfig) -> Router {
    let cors = if !config.cors_origins.is_empty() {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|s| {
                let parsed = s.parse();
                if parsed.is_err() {
                    tracing::warn!(origin = %s, "invalid_cors_origin_ignored");
                }
                parsed.ok()
            })
            .collect();
        Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else if config.cors_allow_all {
        Some(CorsLayer::permissive())
    } else {
        None
    };

    let ping_interval = PingInterval(
        (config.ws_ping_interval_ms > 0).then(|| Duration::from_millis(config.ws_ping_interval_ms)),
    );

    let mut app = Router::new()
        .route("/", get(handle_request).post(handle_request))
        .route("/ping", get(handle_request))
        .route("/watch/:query_id", get(watch_query))
        .route("/health", get(health))
        .route("/live", get(liveness))
        .fallback(handle_request)
        .layer(Extension(ping_interval))
        .layer(Extension(server));

    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app
}

/// Serve until SIGINT or SIGTERM
pub async fn start_http_server(
    server: Arc<Server>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(server, &config.http);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let socket = tokio::net::TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    tracing::info!(%addr, "http_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http_server_stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!(signal = "SIGINT", "shutting_down"),
                    _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutting_down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "sigterm_handler_unavailable");
                let _ = ctrl_c.await;
                tracing::info!(signal = "SIGINT", "shutting_down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!(signal = "SIGINT", "shutting_down");
    }
}

//! Timeouts, cancellation, query id leases and live progress over `/watch`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;
use triplegate::index::TripleIndex;
use triplegate::protocol::rest::create_router;
use triplegate::registry::QueryId;
use triplegate::{Config, Server};

const TOKEN: &str = "lifecycle-token";

/// `n` triples `<s{i}> <p> <o{i}>`; three copies of `?a <p> ?b` multiply
/// to `n^3` rows.
fn wide_index(n: usize) -> TripleIndex {
    TripleIndex::from_triples(
        (0..n).map(|i| (format!("<s{i}>"), "<p>".to_string(), format!("<o{i}>"))),
    )
}

const CROSS_PRODUCT: &str = "SELECT * WHERE { ?a <p> ?b . ?c <p> ?d . ?e <p> ?f }";

fn create_app(index: TripleIndex) -> (Router, Arc<Server>) {
    let mut config = Config::default();
    config.server.num_threads = 2;
    config.server.access_token = Some(TOKEN.to_string());
    let server = Arc::new(Server::new(config.clone(), index).unwrap());
    (create_router(Arc::clone(&server), &config.http), server)
}

fn query_request(query: &str, extra: &[(&str, &str)], query_id: Option<&str>) -> Request<Body> {
    let mut params = vec![("query", query)];
    params.extend_from_slice(extra);
    let mut builder =
        Request::builder().uri(format!("/?{}", serde_urlencoded::to_string(&params).unwrap()));
    if let Some(id) = query_id {
        builder = builder.header("Query-Id", id);
    }
    builder.body(Body::empty()).unwrap()
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn wait_until_active(server: &Server, id: &str) {
    let id = QueryId::new(id);
    for _ in 0..500 {
        if server.registry().is_active(&id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("query {id} never became active");
}

#[tokio::test]
async fn test_timeout_yields_429_with_runtime_information() {
    let (app, server) = create_app(wide_index(300));
    let (status, json) =
        send_json(&app, query_request(CROSS_PRODUCT, &[("timeout", "50ms")], None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["status"], "ERROR");
    assert!(json["exception"].as_str().unwrap().starts_with("Query timed out"));
    assert!(json["runtimeInformation"]["description"].is_string());
    assert_eq!(server.registry().num_active(), 0);
}

#[tokio::test]
async fn test_cancel_query_command_stops_running_query() {
    let (app, server) = create_app(wide_index(300));
    let query_app = app.clone();
    let running = tokio::spawn(async move {
        send_json(&query_app, query_request(CROSS_PRODUCT, &[], Some("long-running"))).await
    });

    wait_until_active(&server, "long-running").await;
    let cancel = Request::builder()
        .uri(format!(
            "/?cmd=cancel-query&cancel-query-id=long-running&access-token={TOKEN}"
        ))
        .body(Body::empty())
        .unwrap();
    let (status, json) = send_json(&app, cancel).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], true);

    let (status, json) = running.await.unwrap();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["exception"].as_str().unwrap().starts_with("Query was cancelled"));
    assert!(!server.registry().is_active(&QueryId::new("long-running")));
}

#[tokio::test]
async fn test_dropped_request_cancels_query() {
    let (app, server) = create_app(wide_index(300));
    let query_app = app.clone();
    let running = tokio::spawn(async move {
        send_json(&query_app, query_request(CROSS_PRODUCT, &[], Some("abandoned"))).await
    });

    wait_until_active(&server, "abandoned").await;
    let handle = server
        .registry()
        .get_cancellation_handle(&QueryId::new("abandoned"))
        .unwrap();
    // Let planning finish so that the query is executing when the client leaves
    tokio::time::sleep(Duration::from_millis(50)).await;
    running.abort();
    let _ = running.await;

    for _ in 0..500 {
        if handle.is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(handle.is_cancelled());
}

#[tokio::test]
async fn test_query_id_is_reusable_after_completion() {
    let (app, _) = create_app(wide_index(3));
    for _ in 0..3 {
        let (status, json) = send_json(
            &app,
            query_request("SELECT ?a WHERE { ?a <p> ?b }", &[], Some("reused")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["resultsize"], 3);
    }
}

#[tokio::test]
async fn test_concurrent_identical_queries_compute_once() {
    let (app, server) = create_app(wide_index(40));
    let query = "SELECT * WHERE { ?a <p> ?b . ?c <p> ?d }";
    let requests = (0..8).map(|_| {
        let app = app.clone();
        tokio::spawn(async move {
            send_json(&app, query_request(query, &[("pinresult", "true")], None)).await
        })
    });
    for request in requests.collect::<Vec<_>>() {
        let (status, json) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["resultsize"], 1600);
    }
    let stats = server.cache().stats();
    // Two scans and the join, each computed by exactly one of the requests
    assert_eq!(stats.computations, 3);
    assert_eq!(stats.num_pinned_entries, 1);
    assert_eq!(server.cache().num_in_progress(), 0);
}

#[tokio::test]
async fn test_watch_streams_progress_until_query_ends() {
    let (app, _server) = create_app(wide_index(20));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_app = app.clone();
    tokio::spawn(async move {
        axum::serve(listener, serve_app).await.unwrap();
    });

    // The observer subscribes before the query exists
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/watch/watched"))
        .await
        .unwrap();

    let (status, _) = send_json(
        &app,
        query_request("SELECT * WHERE { ?a <p> ?b . ?c <p> ?d }", &[], Some("watched")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut updates = Vec::new();
    let collect = async {
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    updates.push(serde_json::from_str::<Value>(&text).unwrap());
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("watch stream did not end");

    assert!(!updates.is_empty());
    let last = updates.last().unwrap();
    assert_eq!(last["status"], "computed");
    assert_eq!(last["result_rows"], 400);
    assert!(updates
        .iter()
        .any(|update| update["status"] == "in_progress"));
}

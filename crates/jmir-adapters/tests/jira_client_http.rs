use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use jmir_adapters::{
    all_issues_filter, IssueSource, JiraClient, JiraClientConfig, PaginationFetcher, SourceError,
};
use jmir_storage::BackoffPolicy;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct MockState {
    search_calls: Arc<Mutex<Vec<HashMap<String, String>>>>,
    auth_headers: Arc<Mutex<Vec<String>>>,
    flaky_failures_left: Arc<Mutex<usize>>,
}

fn issue_json(n: usize) -> Value {
    json!({
        "id": format!("{}", 10_000 + n),
        "key": format!("TEST-{n}"),
        "fields": {
            "summary": format!("Issue {n}"),
            "project": {"id": "10000", "key": "TEST", "name": "Test Project"},
            "status": {"id": "1", "name": "Open", "statusCategory": {"id": 2, "key": "new", "name": "To Do"}},
            "created": "2024-01-15T10:30:00.000+0000",
            "updated": "2024-01-15T11:30:00.000+0000",
            "labels": []
        }
    })
}

async fn search(
    State(state): State<MockState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state
            .auth_headers
            .lock()
            .expect("auth lock")
            .push(value.to_string());
    }
    state
        .search_calls
        .lock()
        .expect("search calls lock")
        .push(params.clone());

    {
        let mut left = state.flaky_failures_left.lock().expect("flaky lock");
        if *left > 0 {
            *left -= 1;
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))).into_response();
        }
    }

    let start_at: usize = params.get("startAt").and_then(|v| v.parse().ok()).unwrap_or(0);
    let max_results: usize = params
        .get("maxResults")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);
    let total = 5usize;
    let end = (start_at + max_results).min(total);
    let issues: Vec<Value> = (start_at..end).map(issue_json).collect();
    Json(json!({
        "startAt": start_at,
        "maxResults": max_results,
        "total": total,
        "issues": issues
    }))
    .into_response()
}

async fn issue(Path(key): Path<String>) -> impl IntoResponse {
    if key == "TEST-1" {
        Json(issue_json(1)).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"errorMessages": ["Issue Does Not Exist"]})),
        )
            .into_response()
    }
}

async fn server_info() -> Json<Value> {
    Json(json!({"version": "9.12.0"}))
}

async fn spawn_mock_server(
    state: MockState,
) -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/rest/api/2/search", get(search))
        .route("/rest/api/2/issue/{key}", get(issue))
        .route("/rest/api/2/serverInfo", get(server_info))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let address: SocketAddr = listener.local_addr().expect("mock listener local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        server.await.expect("run mock server");
    });
    (format!("http://{address}/"), shutdown_tx, handle)
}

fn client(base_url: &str) -> JiraClient {
    let mut config = JiraClientConfig::new(base_url, "svc-jira", "token-123");
    config.timeout = Duration::from_secs(5);
    config.backoff = BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
    };
    JiraClient::new(config).expect("client")
}

#[tokio::test]
async fn paginates_search_with_basic_auth() {
    let state = MockState::default();
    let (base_url, shutdown_tx, server_task) = spawn_mock_server(state.clone()).await;
    let jira = Arc::new(client(&base_url));

    let fetcher = PaginationFetcher::new(jira.clone(), 2);
    let outcome = fetcher
        .fetch(&all_issues_filter(&["TEST".to_string()]), &CancellationToken::new())
        .await
        .expect("fetch");

    assert_eq!(outcome.issues.len(), 5);
    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.issues[0].key, "TEST-0");
    assert_eq!(outcome.issues[4].key, "TEST-4");

    let calls = state.search_calls.lock().expect("calls").clone();
    let starts: Vec<_> = calls.iter().map(|c| c["startAt"].clone()).collect();
    assert_eq!(starts, vec!["0", "2", "4"]);
    assert_eq!(calls[0]["jql"], "project IN ('TEST') ORDER BY updated DESC");
    assert_eq!(calls[0]["maxResults"], "2");

    // base64("svc-jira:token-123")
    let auth = state.auth_headers.lock().expect("auth").clone();
    assert!(auth
        .iter()
        .all(|h| h == "Basic c3ZjLWppcmE6dG9rZW4tMTIz"));

    let _ = shutdown_tx.send(());
    server_task.await.expect("server task");
}

#[tokio::test]
async fn transient_search_failures_are_retried() {
    let state = MockState::default();
    *state.flaky_failures_left.lock().expect("flaky") = 2;
    let (base_url, shutdown_tx, server_task) = spawn_mock_server(state.clone()).await;
    let jira = client(&base_url);

    let page = jira
        .search("project = TEST", 0, 10, &CancellationToken::new())
        .await
        .expect("third attempt succeeds");
    assert_eq!(page.issues.len(), 5);
    assert_eq!(page.total, 5);
    assert_eq!(state.search_calls.lock().expect("calls").len(), 3);

    let _ = shutdown_tx.send(());
    server_task.await.expect("server task");
}

#[tokio::test]
async fn exhausted_retries_surface_as_fetch_failure() {
    let state = MockState::default();
    *state.flaky_failures_left.lock().expect("flaky") = 10;
    let (base_url, shutdown_tx, server_task) = spawn_mock_server(state.clone()).await;
    let jira = client(&base_url);

    let err = jira
        .search("project = TEST", 0, 10, &CancellationToken::new())
        .await
        .expect_err("503 every time");
    assert!(matches!(err, SourceError::Fetch(ref e) if e.status() == Some(503)));

    let _ = shutdown_tx.send(());
    server_task.await.expect("server task");
}

#[tokio::test]
async fn get_by_key_maps_404_to_none() {
    let (base_url, shutdown_tx, server_task) = spawn_mock_server(MockState::default()).await;
    let jira = client(&base_url);
    let cancel = CancellationToken::new();

    let found = jira.get_by_key("TEST-1", &cancel).await.expect("lookup");
    assert_eq!(found.map(|i| i.fields.summary), Some("Issue 1".to_string()));
    let missing = jira.get_by_key("TEST-404", &cancel).await.expect("lookup");
    assert!(missing.is_none());

    let _ = shutdown_tx.send(());
    server_task.await.expect("server task");
}

#[tokio::test]
async fn health_check_reports_reachability() {
    let (base_url, shutdown_tx, server_task) = spawn_mock_server(MockState::default()).await;
    assert!(client(&base_url).health_check().await);
    let _ = shutdown_tx.send(());
    server_task.await.expect("server task");

    // Nothing listens on the discard port.
    assert!(!client("http://127.0.0.1:9").health_check().await);
}

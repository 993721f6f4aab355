//! Shared fixtures for the integration tests: an in-temp-dir service stack
//! and small helpers for driving the router without a socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use sewerrat::config::Config;
use sewerrat::server::{router, AppState};
use sewerrat::storage::sqlite::{Store, StoreOptions};
use sewerrat::verify::VerificationRegistry;
use sewerrat::whitelist::LinkWhitelist;

pub struct TestService {
    pub state: Arc<AppState>,
    pub router: Router,
}

pub fn test_service(scratch: &Path, whitelist: LinkWhitelist) -> TestService {
    let config = Config {
        db_path: scratch.join("index.sqlite3"),
        port: 0,
        url_prefix: String::new(),
        backup_interval: Duration::from_secs(86400),
        update_interval: Duration::from_secs(86400),
        session_lifetime: Duration::from_secs(600),
        busy_timeout: Duration::from_secs(10),
        concurrency: 2,
        path_field: None,
    };
    let store = Store::open(
        &config.db_path,
        StoreOptions {
            busy_timeout: config.busy_timeout,
            concurrency: config.concurrency,
            path_field: config.path_field.clone(),
            whitelist: whitelist.clone(),
        },
    )
    .expect("store opens");

    let state = Arc::new(AppState {
        config: Arc::new(config),
        store: Arc::new(store),
        registry: Arc::new(VerificationRegistry::new()),
        whitelist: Arc::new(whitelist),
        shutdown: CancellationToken::new(),
    });
    TestService {
        router: router(state.clone()),
        state,
    }
}

pub async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds");
    send(router, request).await
}

pub async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request builds");
    send(router, request).await
}

pub async fn get_raw(router: &Router, uri: &str) -> (StatusCode, String, Vec<u8>) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request builds");
    let response = router.clone().oneshot(request).await.expect("send");
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    (status, content_type, bytes.to_vec())
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("send");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Run the full two-phase registration for `dir`, returning the comments.
pub async fn register(router: &Router, dir: &Path, base: Option<&[&str]>) -> Vec<String> {
    let (status, body) = post_json(router, "/register/start", json!({ "path": dir })).await;
    assert_eq!(status, StatusCode::ACCEPTED, "start: {body}");
    assert_eq!(body["status"], "PENDING");
    let code = body["code"].as_str().expect("a verification code");

    std::fs::write(dir.join(code), b"").expect("verification file");

    let mut finish = json!({ "path": dir });
    if let Some(base) = base {
        finish["base"] = json!(base);
    }
    let (status, body) = post_json(router, "/register/finish", finish).await;
    assert_eq!(status, StatusCode::OK, "finish: {body}");
    assert_eq!(body["status"], "SUCCESS");
    body["comments"]
        .as_array()
        .expect("comments array")
        .iter()
        .map(|c| c.as_str().unwrap_or_default().to_string())
        .collect()
}

/// Paths of a /query result set.
pub fn result_paths(body: &Value) -> Vec<String> {
    body["results"]
        .as_array()
        .expect("results array")
        .iter()
        .map(|row| row["path"].as_str().expect("path").to_string())
        .collect()
}

/// Shift a file's mtime into the past so later writes are seen as changes.
pub fn backdate(path: &Path, seconds: u64) {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("open for backdating");
    let then = std::time::SystemTime::now() - Duration::from_secs(seconds);
    file.set_times(std::fs::FileTimes::new().set_modified(then))
        .expect("set mtime");
}

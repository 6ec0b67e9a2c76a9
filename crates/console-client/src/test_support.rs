//! Scripted in-process backend shared by the executor, upload and download tests.
//!
//! Each path has a fixed behaviour; every request is recorded so tests can
//! count attempts per path and inspect what was sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use console_auth::{Credential, CredentialStore, now_millis};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::client::{ApiClient, ClientConfig};
use crate::retry::RetryPolicy;

/// One request as the backend received it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub idempotency_key: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Clone, Default)]
struct MockState {
    seen: Arc<Mutex<HashMap<String, Vec<Seen>>>>,
}

impl MockState {
    /// Record the request and return its 1-based hit number for the path.
    fn record(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: &Bytes) -> usize {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let mut seen = self.seen.lock().unwrap();
        let entries = seen.entry(uri.path().to_string()).or_default();
        entries.push(Seen {
            method: method.to_string(),
            query: uri.query().map(str::to_string),
            authorization: header("authorization"),
            idempotency_key: header("idempotency-key"),
            content_type: header("content-type"),
            body: body.clone(),
        });
        entries.len()
    }
}

pub struct MockBackend {
    pub base_url: String,
    state: MockState,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = MockState::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .fallback(handle)
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// Requests received on `path`, in arrival order.
    pub fn seen(&self, path: &str) -> Vec<Seen> {
        self.state
            .seen
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.seen(path).len()
    }

    /// Total requests across every path.
    pub fn total_hits(&self) -> usize {
        self.state.seen.lock().unwrap().values().map(Vec::len).sum()
    }
}

async fn handle(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let hit = state.record(&method, &uri, &headers, &body);
    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    match uri.path() {
        "/auth/login" => {
            if parsed["password"] != "hunter2" {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "detail": "Incorrect username or password" })),
                )
                    .into_response();
            }
            Json(json!({
                "access_token": "A1",
                "refresh_token": "R1",
                "token_type": "bearer",
                "expires_in": 3600,
            }))
            .into_response()
        }
        "/auth/refresh" => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if parsed["refresh_token"] == "revoked" {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "detail": "refresh token revoked" })),
                )
                    .into_response();
            }
            Json(json!({
                "access_token": "A2",
                "token_type": "bearer",
                "expires_in": 3600,
            }))
            .into_response()
        }
        "/echo" => Json(json!({
            "method": method.as_str(),
            "query": uri.query(),
            "authorization": headers.get("authorization").and_then(|v| v.to_str().ok()),
            "accept": headers.get("accept").and_then(|v| v.to_str().ok()),
            "body": parsed,
        }))
        .into_response(),
        "/flaky" => {
            if hit <= 2 {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "detail": "maintenance" })),
                )
                    .into_response();
            }
            Json(json!({ "ok": true, "attempt": hit })).into_response()
        }
        "/broken" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "boom" })),
        )
            .into_response(),
        "/invalid" => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": [
                { "loc": ["body", "title"], "msg": "field required", "type": "missing" }
            ]})),
        )
            .into_response(),
        "/limited" => {
            if hit == 1 {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "detail": "slow down", "retry_after": 1 })),
                )
                    .into_response();
            }
            Json(json!({ "ok": true })).into_response()
        }
        "/throttled" => {
            if hit == 1 {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, "7")],
                    Json(json!({ "detail": "slow down" })),
                )
                    .into_response();
            }
            Json(json!({ "ok": true })).into_response()
        }
        "/overloaded" => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "maintenance" })),
        )
            .into_response(),
        "/unauthorized" => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "token revoked" })),
        )
            .into_response(),
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Json(json!({ "ok": true })).into_response()
        }
        "/not-json" => "definitely not json".into_response(),
        "/reports/7/export" => (
            [
                (header::CONTENT_TYPE, "application/pdf"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"q3-report.pdf\"",
                ),
            ],
            Bytes::from_static(b"%PDF-1.7 fake report"),
        )
            .into_response(),
        "/exports/findings.csv" => (
            [(header::CONTENT_TYPE, "text/csv")],
            Bytes::from_static(b"id,title\n1,SQLi\n"),
        )
            .into_response(),
        "/attachments" => Json(json!({
            "received_bytes": body.len(),
            "content_type": headers.get("content-type").and_then(|v| v.to_str().ok()),
        }))
        .into_response(),
        "/attachments/flaky" => {
            if hit == 1 {
                return StatusCode::BAD_GATEWAY.into_response();
            }
            Json(json!({ "ok": true })).into_response()
        }
        "/attachments/broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        _ => (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not Found" }))).into_response(),
    }
}

/// Retry timings short enough for tests that use real sockets.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

pub fn test_config(base_url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(base_url);
    config.timeout = Duration::from_secs(5);
    config.retry = fast_retry();
    config.upload.retry.initial_delay = Duration::from_millis(10);
    config
}

/// Client whose stored credential expires `expires_in_ms` from now.
pub async fn signed_in_client(backend: &MockBackend, refresh: &str, expires_in_ms: u64) -> ApiClient {
    let store = Arc::new(CredentialStore::in_memory());
    store
        .replace(Credential::new(
            "A1",
            refresh,
            Some(now_millis() + expires_in_ms),
        ))
        .await;
    ApiClient::new(test_config(&backend.base_url), store)
}

/// Signed in with an hour of validity left.
pub async fn fresh_client(backend: &MockBackend) -> ApiClient {
    signed_in_client(backend, "R1", 3_600_000).await
}

//! The HTTP surface over the core: webhook ingest plus read-only views and
//! review actions. Every mutating handler is a thin wrapper over exactly
//! one task-store write; the webhook handler acknowledges fast and defers
//! real processing to a background task.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use reelflow_store::{StoreError, TaskFilter, TaskStore};
use reelflow_sync::WebhookProcessor;
use reelflow_types::{TaskPatch, TaskStatus};

const SIGNATURE_HEADER: &str = "x-notion-signature";

#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub processor: Arc<WebhookProcessor>,
    pub webhook_secret: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/health", get(health))
        .route("/webhook/notion", post(webhook_receive))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/approve", post(approve_gate))
        .route("/tasks/{id}/reject", post(reject_gate))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Constant-shape HMAC-SHA256 check over the raw body. The header value
/// may carry a `sha256=` prefix.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let presented = header_value.trim().trim_start_matches("sha256=");
    let Ok(presented) = hex::decode(presented) else {
        return false;
    };
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&presented).is_ok()
}

/// Idempotent, non-blocking ingest. The 200 goes out as soon as the
/// delivery is syntactically sound; dedup and page fetching happen on a
/// spawned task so the planning side never waits on us.
async fn webhook_receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = &state.webhook_secret {
        let presented = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, presented) {
            warn!("webhook signature rejected");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(event_id) = payload.get("event_id").and_then(Value::as_str).map(String::from) else {
        return StatusCode::BAD_REQUEST;
    };

    let processor = state.processor.clone();
    tokio::spawn(async move {
        match processor.process(&event_id, &payload).await {
            Ok(outcome) => info!(event_id, ?outcome, "webhook processed"),
            Err(e) => error!(event_id, error = %e, "webhook processing failed"),
        }
    });

    StatusCode::OK
}

#[derive(Debug, Deserialize, Default)]
struct ListTasksQuery {
    status: Option<String>,
    channel: Option<String>,
    limit: Option<i64>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(raw) => match TaskStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return error_response(StatusCode::BAD_REQUEST, format!("unknown status `{raw}`"))
            }
        },
        None => None,
    };

    match state
        .store
        .list_tasks(TaskFilter {
            status,
            channel_id: query.channel,
            limit: query.limit,
        })
        .await
    {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get_task(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => store_error_response(e),
    }
}

/// Move a task sitting at a review gate to its approved successor.
async fn approve_gate(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let task = match state.store.get_task(id).await {
        Ok(task) => task,
        Err(e) => return store_error_response(e),
    };
    let Some(next) = task.status.approved_successor() else {
        return error_response(
            StatusCode::CONFLICT,
            format!("task is in `{}`, not at a review gate", task.status),
        );
    };
    match state
        .store
        .update_status(id, task.status, next, TaskPatch::default())
        .await
    {
        Ok(task) => Json(task).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct RejectInput {
    reason: String,
}

/// Reject at a review gate: the task lands in the gate's terminal error
/// state with the reviewer's reason on the log.
async fn reject_gate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<RejectInput>,
) -> Response {
    let task = match state.store.get_task(id).await {
        Ok(task) => task,
        Err(e) => return store_error_response(e),
    };
    if !task.status.is_gate() {
        return error_response(
            StatusCode::CONFLICT,
            format!("task is in `{}`, not at a review gate", task.status),
        );
    }
    let Some(terminal) = task.status.error_state() else {
        return error_response(StatusCode::CONFLICT, "gate has no error state".to_string());
    };
    match state
        .store
        .update_status(
            id,
            task.status,
            terminal,
            TaskPatch::error(format!("rejected by reviewer: {}", input.reason)),
        )
        .await
    {
        Ok(task) => Json(task).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let task = match state.store.get_task(id).await {
        Ok(task) => task,
        Err(e) => return store_error_response(e),
    };
    if task.status.is_terminal() {
        return error_response(
            StatusCode::CONFLICT,
            format!("task is already terminal in `{}`", task.status),
        );
    }
    match state
        .store
        .update_status(id, task.status, TaskStatus::Cancelled, TaskPatch::default())
        .await
    {
        Ok(task) => Json(task).into_response(),
        Err(e) => store_error_response(e),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error_response(err: StoreError) -> Response {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists => StatusCode::CONFLICT,
        StoreError::Conflict { .. } | StoreError::IllegalTransition { .. } => StatusCode::CONFLICT,
        StoreError::NegativeDelta(_) => StatusCode::BAD_REQUEST,
        StoreError::InvalidRow(_) | StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::io::Write;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let store =
            TaskStore::connect_lazy("postgres://localhost/reelflow_unused").expect("lazy pool");

        let mut file = tempfile::NamedTempFile::new().expect("temp config");
        file.write_all(b"channels: []\n").expect("write");
        let vault = Arc::new(reelflow_vault::Vault::from_key_bytes(&[1u8; 32]).expect("vault"));
        let registry = reelflow_registry::ChannelRegistry::load(file.path(), vault)
            .await
            .expect("registry");
        // Keep the config file alive for the registry's lifetime.
        std::mem::forget(file);

        let limiter = Arc::new(reelflow_notion::RateLimiter::planning_default());
        let notion = reelflow_notion::NotionClient::new("test-token", limiter);
        let processor = Arc::new(WebhookProcessor::new(store.clone(), notion, registry));

        AppState {
            store,
            processor,
            webhook_secret: None,
        }
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).expect("req"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_acknowledges_quickly_and_defers_work() {
        let app = router(test_state().await);
        let body = serde_json::to_vec(&json!({
            "event_id": "evt-123",
            "page_id": "1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d"
        }))
        .expect("body");

        let started = std::time::Instant::now();
        let response = app
            .oneshot(
                Request::post("/webhook/notion")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("req"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[tokio::test]
    async fn webhook_rejects_malformed_payloads() {
        let app = router(test_state().await);
        let response = app
            .clone()
            .oneshot(
                Request::post("/webhook/notion")
                    .body(Body::from("not json"))
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::post("/webhook/notion")
                    .body(Body::from(r#"{"no_event_id": true}"#))
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_enforces_the_signature_when_configured() {
        let mut state = test_state().await;
        state.webhook_secret = Some("topsecret".to_string());
        let app = router(state);

        let body = br#"{"event_id": "evt-9"}"#.to_vec();
        let response = app
            .clone()
            .oneshot(
                Request::post("/webhook/notion")
                    .header(SIGNATURE_HEADER, "sha256=deadbeef")
                    .body(Body::from(body.clone()))
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut mac =
            Hmac::<Sha256>::new_from_slice(b"topsecret").expect("mac");
        mac.update(&body);
        let signature = hex::encode(mac.finalize().into_bytes());
        let response = app
            .oneshot(
                Request::post("/webhook/notion")
                    .header(SIGNATURE_HEADER, format!("sha256={signature}"))
                    .body(Body::from(body))
                    .expect("req"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn signature_check_round_trips() {
        let secret = "s3cret";
        let body = b"payload bytes";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(body);
        let good = hex::encode(mac.finalize().into_bytes());

        assert!(verify_signature(secret, body, &good));
        assert!(verify_signature(secret, body, &format!("sha256={good}")));
        assert!(!verify_signature(secret, body, "sha256=00ff"));
        assert!(!verify_signature(secret, b"other body", &good));
        assert!(!verify_signature(secret, body, "not-hex!"));
    }
}

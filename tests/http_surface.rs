//! Admin and error-contract behavior of the HTTP router.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use shelf::config::Config;
use shelf::server::{router, AppState};

async fn app() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.db.path = dir.path().join("shelf.sqlite");
    config.tools.commerce_base_url = "http://127.0.0.1:9".to_string();
    config.rag.os_url = "http://127.0.0.1:9".to_string();
    config.model_service.url = "http://127.0.0.1:9".to_string();
    config.llm.url = "http://127.0.0.1:9".to_string();
    let state = AppState::build(&config).await.unwrap();
    (dir, router(state))
}

struct Reply {
    status: StatusCode,
    trace_id: Option<String>,
    body: Value,
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>, trace: Option<&str>) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(trace) = trace {
        builder = builder.header("x-trace-id", trace);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let trace_id = response
        .headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()));
    Reply {
        status,
        trace_id,
        body,
    }
}

#[tokio::test]
async fn test_health_reports_version_and_echoes_trace() {
    let (_dir, app) = app().await;
    let reply = send(&app, "GET", "/health", None, Some("trace-abc")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["status"], "ok");
    assert_eq!(reply.body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(reply.trace_id.as_deref(), Some("trace-abc"));

    let generated = send(&app, "GET", "/health", None, None).await;
    assert!(generated.trace_id.is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn test_malformed_chat_body_uses_error_envelope() {
    let (_dir, app) = app().await;
    let reply = send(&app, "POST", "/chat", Some("{not json"), Some("trace-bad")).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], "bad_request");
    assert_eq!(reply.body["trace_id"], "trace-bad");
    assert!(reply.body["request_id"].as_str().is_some());
}

#[tokio::test]
async fn test_session_state_validation_and_reset() {
    let (_dir, app) = app().await;
    let invalid = send(&app, "GET", "/internal/chat/session/state?session_id=bad%20id", None, None).await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    assert_eq!(invalid.body["error"]["code"], "invalid_session_id");

    let missing = send(&app, "GET", "/internal/chat/session/state?session_id=s-404", None, None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let chat = json!({"session_id": "s-1", "message": {"content": "환불 가능한가요?"}}).to_string();
    let turn = send(&app, "POST", "/chat", Some(&chat), None).await;
    assert_eq!(turn.status, StatusCode::OK);

    let state = send(&app, "GET", "/internal/chat/session/state?session_id=s-1", None, None).await;
    assert_eq!(state.status, StatusCode::OK);
    assert_eq!(state.body["state"]["state_version"], 1);

    let reset = send(
        &app,
        "POST",
        "/internal/chat/session/reset",
        Some(r#"{"session_id": "s-1"}"#),
        None,
    )
    .await;
    assert_eq!(reset.status, StatusCode::OK);
    assert_eq!(reset.body["reset"], true);
    assert_eq!(reset.body["state"]["state_version"], 2);
}

#[tokio::test]
async fn test_retention_accepts_empty_body() {
    let (_dir, app) = app().await;
    let dry = send(&app, "POST", "/internal/chat/retention", Some(r#"{"dry_run": true}"#), None).await;
    assert_eq!(dry.status, StatusCode::OK);
    assert_eq!(dry.body["dry_run"], true);

    let real = send(&app, "POST", "/internal/chat/retention", None, None).await;
    assert_eq!(real.status, StatusCode::OK);
    assert_eq!(real.body["dry_run"], false);
}

#[tokio::test]
async fn test_reindex_job_admin_contract() {
    let (_dir, app) = app().await;
    let created = send(&app, "POST", "/internal/index/reindex-jobs", Some(r#"{"batch_size": 50}"#), None).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["status"], "CREATED");
    assert_eq!(created.body["logical_name"], "books_doc");
    assert_eq!(created.body["params"]["batch_size"], 50);
    let job_id = created.body["job_id"].as_str().unwrap().to_string();

    let conflict = send(&app, "POST", "/internal/index/reindex-jobs", None, None).await;
    assert_eq!(conflict.status, StatusCode::CONFLICT);
    assert_eq!(conflict.body["error"]["code"], "job_in_progress");

    let fetched = send(&app, "GET", &format!("/internal/index/reindex-jobs/{}", job_id), None, None).await;
    assert_eq!(fetched.status, StatusCode::OK);
    assert_eq!(fetched.body["job_id"], job_id.as_str());

    let resume = send(&app, "POST", &format!("/internal/index/reindex-jobs/{}/resume", job_id), None, None).await;
    assert_eq!(resume.status, StatusCode::CONFLICT);
    assert_eq!(resume.body["error"]["code"], "invalid_transition");

    let pause = send(&app, "POST", &format!("/internal/index/reindex-jobs/{}/pause", job_id), None, None).await;
    assert_eq!(pause.status, StatusCode::OK);
    assert_eq!(pause.body["status"], "PAUSED");

    let unknown = send(&app, "POST", &format!("/internal/index/reindex-jobs/{}/explode", job_id), None, None).await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);

    let missing = send(&app, "GET", "/internal/index/reindex-jobs/nope", None, None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_explain_requires_query_and_providers_lists_routes() {
    let (_dir, app) = app().await;
    let empty = send(&app, "POST", "/internal/rag/explain", Some(r#"{"query": "  "}"#), None).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);

    let providers = send(&app, "GET", "/internal/chat/providers", None, None).await;
    assert_eq!(providers.status, StatusCode::OK);
    assert_eq!(providers.body["providers"][0]["name"], "primary");
}

#[tokio::test]
async fn test_metrics_render_prometheus_text() {
    let (_dir, app) = app().await;
    let chat = json!({"session_id": "s-m", "message": {"content": "환불 가능한가요?"}}).to_string();
    send(&app, "POST", "/chat", Some(&chat), None).await;
    let metrics = send(&app, "GET", "/internal/metrics", None, None).await;
    assert_eq!(metrics.status, StatusCode::OK);
    let text = metrics.body.as_str().unwrap();
    assert!(text.contains("chat_turn_total"));
}

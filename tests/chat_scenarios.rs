//! End-to-end chat scenarios through the HTTP router.
//!
//! Commerce, OpenSearch, the model service and LLM providers are wiremock
//! servers; sessions live in a temporary SQLite database.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shelf::config::Config;
use shelf::server::{router, AppState};

struct Harness {
    _dir: TempDir,
    state: AppState,
    app: Router,
}

async fn harness(commerce: &str, search: &str, llm: &str, fallbacks: Vec<String>) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.db.path = dir.path().join("shelf.sqlite");
    config.tools.commerce_base_url = commerce.to_string();
    config.tools.tool_lookup_timeout_sec = 0.5;
    config.rag.os_url = search.to_string();
    config.model_service.url = search.to_string();
    config.llm.url = llm.to_string();
    config.llm.fallback_urls = fallbacks;
    config.llm.timeout_sec = 2.0;

    let state = AppState::build(&config).await.unwrap();
    let app = router(state.clone());
    Harness {
        _dir: dir,
        state,
        app,
    }
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, String) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn chat(app: &Router, body: Value) -> Value {
    let (status, text) = post(app, "/chat", body).await;
    assert_eq!(status, StatusCode::OK, "{}", text);
    serde_json::from_str(&text).unwrap()
}

fn message(session: &str, user: Option<&str>, content: &str) -> Value {
    json!({
        "session_id": session,
        "message": {"role": "user", "content": content},
        "client": {"user_id": user},
    })
}

/// `(event, data)` pairs from an SSE body.
fn sse_events(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut name = None;
            let mut data = String::new();
            for line in block.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data.push_str(v.trim_start());
                }
            }
            Some((name?, serde_json::from_str(&data).ok()?))
        })
        .collect()
}

const UNUSED: &str = "http://127.0.0.1:9";

#[tokio::test]
async fn test_order_lookup_without_user_needs_login() {
    let h = harness(UNUSED, UNUSED, UNUSED, Vec::new()).await;
    let response = chat(
        &h.app,
        json!({"message": {"role": "user", "content": "주문 12 상태 알려줘"}}),
    )
    .await;
    assert_eq!(response["status"], "needs_auth");
    assert_eq!(response["reason_code"], "AUTH_REQUIRED");
    assert_eq!(response["next_action"], "LOGIN_REQUIRED");
    assert_eq!(response["version"], "v1");
}

#[tokio::test]
async fn test_confirmed_cancel_executes_once() {
    let commerce = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders/12/cancel"))
        .and(header_regex("idempotency-key", "^chat:order_cancel:"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"order": {"status": "CANCELED"}})))
        .expect(1)
        .mount(&commerce)
        .await;
    let h = harness(&commerce.uri(), UNUSED, UNUSED, Vec::new()).await;

    let started = chat(&h.app, message("cancel-1", Some("1"), "주문 12 취소해줘")).await;
    assert_eq!(started["status"], "pending_confirmation");
    assert_eq!(started["next_action"], "CONFIRM_ACTION");

    let token = h
        .state
        .chat()
        .session_state("cancel-1")
        .await
        .unwrap()
        .unwrap()
        .pending_action
        .unwrap()
        .confirm_token;

    let confirmed = chat(&h.app, message("cancel-1", Some("1"), &format!("확인 {}", token))).await;
    assert_eq!(confirmed["status"], "ok");
    assert!(!confirmed["citations"].as_array().unwrap().is_empty());

    let state = h.state.chat().session_state("cancel-1").await.unwrap().unwrap();
    assert!(state.pending_action.is_none());
}

#[tokio::test]
async fn test_wrong_token_keeps_waiting_without_mutation() {
    let commerce = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&commerce)
        .await;
    let h = harness(&commerce.uri(), UNUSED, UNUSED, Vec::new()).await;

    chat(&h.app, message("cancel-2", Some("1"), "주문 12 취소해줘")).await;
    let pending = h
        .state
        .chat()
        .session_state("cancel-2")
        .await
        .unwrap()
        .unwrap()
        .pending_action
        .unwrap();
    assert_ne!(pending.confirm_token, "aaaaaa");

    let response = chat(&h.app, message("cancel-2", Some("1"), "확인 AAAAAA")).await;
    assert_eq!(response["status"], "pending_confirmation");
    assert_eq!(response["reason_code"], "CONFIRMATION_REQUIRED");
}

#[tokio::test]
async fn test_confirm_from_another_caller_is_refused() {
    let commerce = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&commerce)
        .await;
    let h = harness(&commerce.uri(), UNUSED, UNUSED, Vec::new()).await;

    chat(&h.app, message("cancel-3", Some("1"), "주문 12 취소해줘")).await;
    let token = h
        .state
        .chat()
        .session_state("cancel-3")
        .await
        .unwrap()
        .unwrap()
        .pending_action
        .unwrap()
        .confirm_token;

    let anonymous = chat(&h.app, message("cancel-3", None, &format!("확인 {}", token))).await;
    assert_eq!(anonymous["reason_code"], "AUTH_REQUIRED");
    let other = chat(&h.app, message("cancel-3", Some("2"), &format!("확인 {}", token))).await;
    assert_eq!(other["reason_code"], "AUTH_FORBIDDEN");

    let state = h.state.chat().session_state("cancel-3").await.unwrap().unwrap();
    assert_eq!(state.pending_action.unwrap().actor_user_id.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_duplicate_ticket_reused_across_sessions() {
    let commerce = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/support/tickets"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ticket": {"ticket_id": 5, "ticket_no": "STK-0005", "status": "RECEIVED"}
        })))
        .expect(1)
        .mount(&commerce)
        .await;
    let h = harness(&commerce.uri(), UNUSED, UNUSED, Vec::new()).await;

    let first = chat(&h.app, message("ticket-a", Some("7"), "문의 접수해줘 결제가 안돼")).await;
    assert_eq!(first["status"], "ok");
    let second = chat(&h.app, message("ticket-b", Some("7"), "문의 접수해줘 결제가 안돼")).await;
    assert_eq!(second["status"], "ok");
    let content = second["answer"]["content"].as_str().unwrap();
    assert!(content.contains("STK-0005"));
    assert!(content.contains("재사용"));
}

#[tokio::test]
async fn test_stream_fails_over_to_fallback_before_first_delta() {
    let search = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/docs_doc_read/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": {"hits": [{
            "_id": "chunk-1", "_score": 2.0, "_source": {
                "chunk_id": "chunk-1", "doc_id": "doc-1", "citation_key": "chunk-1#key",
                "title": "토지", "content": "박경리의 대하소설"
            }
        }]}})))
        .mount(&search)
        .await;
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&primary)
        .await;
    let fallback = MockServer::start().await;
    let body = concat!(
        "event: meta\ndata: {\"model\":\"b\"}\n\n",
        "event: delta\ndata: {\"delta\":\"토지는 박경리의 \"}\n\n",
        "event: delta\ndata: {\"delta\":\"대하소설입니다.\"}\n\n",
        "event: done\ndata: {\"citations\":[\"chunk-1\"]}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&fallback)
        .await;

    let h = harness(UNUSED, &search.uri(), &primary.uri(), vec![fallback.uri()]).await;
    let (status, text) = post(&h.app, "/chat/stream", message("rag-1", None, "토지의 작가는 누구인가")).await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&text);
    assert_eq!(events.first().map(|e| e.0.as_str()), Some("meta"));
    assert!(events.iter().any(|e| e.0 == "delta"));
    let (name, done) = events.last().unwrap();
    assert_eq!(name, "done");
    assert_eq!(done["status"], "ok");
    assert_eq!(done["citations"], json!(["chunk-1"]));

    let metrics = h.state.chat().metrics();
    assert_eq!(
        metrics.counter(
            "chat_provider_failover_total",
            &[("from", "primary"), ("to", "fallback_1"), ("reason", "http_500")]
        ),
        1.0
    );
}

#[tokio::test]
async fn test_refund_policy_served_from_topic_without_llm() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&llm)
        .await;
    let h = harness(UNUSED, UNUSED, &llm.uri(), Vec::new()).await;

    let response = chat(&h.app, message("policy-1", None, "환불 가능한가요?")).await;
    assert_eq!(response["status"], "ok");
    assert_eq!(response["citations"], json!(["POLICY / commerce-refund-guide"]));
    assert_eq!(response["sources"][0]["snippet"], "상품 수령 후 7일 이내 환불을 신청할 수 있습니다.");
}

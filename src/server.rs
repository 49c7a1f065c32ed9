//! HTTP surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | One chat turn (SSE when `options.stream` is true) |
//! | `POST` | `/chat/stream` | One chat turn as SSE: `meta`, `delta`, `done` or `error` |
//! | `POST` | `/internal/rag/explain` | Understanding, decision, retrieval trace, route preview |
//! | `GET`  | `/internal/chat/providers` | LLM provider health and routing settings |
//! | `GET`  | `/internal/chat/session/state` | Stored session (`?session_id=`) |
//! | `POST` | `/internal/chat/session/reset` | Clear pending action, selection and fallbacks |
//! | `POST` | `/internal/chat/retention` | Retention pass (`{dry_run}`) |
//! | `POST` | `/internal/index/reindex-jobs` | Create a reindex job |
//! | `GET`  | `/internal/index/reindex-jobs/{id}` | Job status and progress |
//! | `POST` | `/internal/index/reindex-jobs/{id}/{pause,resume,retry}` | Admin transitions |
//! | `GET`  | `/internal/metrics` | Prometheus text |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" },
//!   "trace_id": "…", "request_id": "…" }
//! ```
//!
//! Error codes: `bad_request` (400), `invalid_session_id` (400),
//! `not_found` (404), `invalid_transition` (409), `job_in_progress` (409),
//! `internal` (500). Chat turns never use this envelope: their failures are
//! reason codes inside a normal `200` response.
//!
//! # Correlation
//!
//! `x-trace-id` and `x-request-id` are taken from the request (generated
//! when missing) and echoed on every response. `x-user-id` and
//! `x-admin-id` fill `client.user_id` / `client.admin_id` when the body
//! leaves them out.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Json, Router,
};
use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use shelf_core::metrics::Metrics;
use shelf_core::models::ChatRequest;
use shelf_core::redact::Redactor;
use shelf_core::reindex::{AdminAction, ReindexParams};
use shelf_core::store::memory::InMemorySessionStore;
use shelf_core::store::SessionStore;

use crate::cache::build_cache;
use crate::chat::{ChatService, ExplainRequest, StreamEvent, TurnIds};
use crate::config::Config;
use crate::db;
use crate::migrate::apply_schema;
use crate::reindex::jobs::{AdminError, JobRepository};
use crate::session_store::SqliteSessionStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    chat: ChatService,
    jobs: JobRepository,
    metrics: Arc<Metrics>,
}

impl AppState {
    /// Open the database, apply the schema, and wire the chat service.
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        apply_schema(&pool).await?;
        let metrics = Arc::new(Metrics::new());
        let redactor = Redactor::with_metrics(metrics.clone());
        let store: Arc<dyn SessionStore> = if config.session.enabled {
            Arc::new(SqliteSessionStore::new(pool.clone(), redactor))
        } else {
            tracing::warn!("session persistence disabled; using in-memory sessions");
            Arc::new(InMemorySessionStore::new(redactor))
        };
        let cache = build_cache(&config.cache)?;
        let chat = ChatService::new(config, store, cache, metrics.clone())
            .context("Failed to build chat service")?;
        Ok(Self {
            config: Arc::new(config.clone()),
            chat,
            jobs: JobRepository::new(pool),
            metrics,
        })
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/internal/rag/explain", post(handle_explain))
        .route("/internal/chat/providers", get(handle_providers))
        .route("/internal/chat/session/state", get(handle_session_state))
        .route("/internal/chat/session/reset", post(handle_session_reset))
        .route("/internal/chat/retention", post(handle_retention))
        .route("/internal/index/reindex-jobs", post(handle_create_job))
        .route("/internal/index/reindex-jobs/{id}", get(handle_get_job))
        .route("/internal/index/reindex-jobs/{id}/{action}", post(handle_job_action))
        .route("/internal/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn(correlate))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`.
pub async fn run_server(config: &Config) -> Result<()> {
    let state = AppState::build(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "shelf server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Correlation ============

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn correlate(mut request: Request, next: Next) -> Response {
    let ids = TurnIds::new(
        header(request.headers(), "x-trace-id"),
        header(request.headers(), "x-request-id"),
    );
    request.extensions_mut().insert(ids.clone());
    let mut response = next.run(request).await;
    for (name, value) in [("x-trace-id", &ids.trace_id), ("x-request-id", &ids.request_id)] {
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    trace_id: String,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    ids: TurnIds,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>, ids: &TurnIds) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            ids: ids.clone(),
        }
    }

    fn bad_request(message: impl Into<String>, ids: &TurnIds) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message, ids)
    }

    fn not_found(message: impl Into<String>, ids: &TurnIds) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message, ids)
    }

    fn internal(err: anyhow::Error, ids: &TurnIds) -> Self {
        tracing::error!(trace_id = %ids.trace_id, error = %format!("{:#}", err), "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error", ids)
    }

    fn admin(err: AdminError, ids: &TurnIds) -> Self {
        match err {
            AdminError::NotFound(_) => Self::not_found(err.to_string(), ids),
            AdminError::Active { .. } => {
                Self::new(StatusCode::CONFLICT, "job_in_progress", err.to_string(), ids)
            }
            AdminError::InvalidTransition(_) => {
                Self::new(StatusCode::CONFLICT, "invalid_transition", err.to_string(), ids)
            }
            AdminError::Store(inner) => Self::internal(inner, ids),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
            trace_id: self.ids.trace_id,
            request_id: self.ids.request_id,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Parse a JSON body; an empty body yields `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes, ids: &TurnIds) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("invalid JSON body: {}", e), ids))
}

fn parse_required<T: DeserializeOwned>(body: &Bytes, ids: &TurnIds) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("invalid JSON body: {}", e), ids))
}

// ============ POST /chat, /chat/stream ============

fn chat_request(body: &Bytes, headers: &HeaderMap, ids: &TurnIds) -> Result<ChatRequest, AppError> {
    let mut request: ChatRequest = parse_required(body, ids)?;
    if request.client.user_id.is_none() {
        request.client.user_id = header(headers, "x-user-id");
    }
    if request.client.admin_id.is_none() {
        request.client.admin_id = header(headers, "x-admin-id");
    }
    Ok(request)
}

fn sse(state: &AppState, request: ChatRequest, ids: TurnIds) -> Response {
    let events = state.chat.handle_turn_stream(request, ids).map(|event: StreamEvent| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.data().to_string()),
        )
    });
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_chat(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = chat_request(&body, &headers, &ids)?;
    if request.options.stream == Some(true) {
        return Ok(sse(&state, request, ids));
    }
    let response = state.chat.handle_turn(request, &ids).await;
    Ok(Json(response).into_response())
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = chat_request(&body, &headers, &ids)?;
    Ok(sse(&state, request, ids))
}

// ============ Chat admin ============

async fn handle_explain(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: ExplainRequest = parse_required(&body, &ids)?;
    if request.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty", &ids));
    }
    let explanation = state
        .chat
        .explain(&request)
        .await
        .map_err(|e| AppError::internal(e, &ids))?;
    Ok(Json(explanation).into_response())
}

async fn handle_providers(State(state): State<AppState>) -> Response {
    Json(state.chat.gateway().snapshot().await).into_response()
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: String,
}

fn check_session_id(state: &AppState, session_id: &str, ids: &TurnIds) -> Result<(), AppError> {
    if state.chat.is_valid_session_id(session_id) {
        Ok(())
    } else {
        Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_session_id",
            format!("invalid session_id: {}", session_id),
            ids,
        ))
    }
}

async fn handle_session_state(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, AppError> {
    check_session_id(&state, &query.session_id, &ids)?;
    let session = state
        .chat
        .session_state(&query.session_id)
        .await
        .map_err(|e| AppError::internal(e, &ids))?
        .ok_or_else(|| AppError::not_found(format!("session {} not found", query.session_id), &ids))?;
    Ok(Json(json!({ "session_id": query.session_id, "state": session })).into_response())
}

async fn handle_session_reset(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    body: Bytes,
) -> Result<Response, AppError> {
    let query: SessionQuery = parse_required(&body, &ids)?;
    check_session_id(&state, &query.session_id, &ids)?;
    let session = state
        .chat
        .reset_session(&query.session_id)
        .await
        .map_err(|e| AppError::internal(e, &ids))?;
    Ok(Json(json!({ "session_id": query.session_id, "reset": true, "state": session })).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct RetentionRequest {
    #[serde(default)]
    dry_run: bool,
}

async fn handle_retention(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: RetentionRequest = parse_body(&body, &ids)?;
    let report = state
        .chat
        .run_retention(request.dry_run)
        .await
        .map_err(|e| AppError::internal(e, &ids))?;
    Ok(Json(report).into_response())
}

// ============ Reindex jobs ============

async fn handle_create_job(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    body: Bytes,
) -> Result<Response, AppError> {
    let params: ReindexParams = parse_body(&body, &ids)?;
    let logical_name = params
        .logical_name
        .clone()
        .unwrap_or_else(|| state.config.reindex.logical_name.clone());
    let job = state
        .jobs
        .create(&logical_name, params)
        .await
        .map_err(|e| AppError::admin(e, &ids))?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

async fn handle_get_job(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .jobs
        .get(&job_id)
        .await
        .map_err(|e| AppError::internal(e, &ids))?
        .ok_or_else(|| AppError::not_found(format!("reindex job {} not found", job_id), &ids))?;
    Ok(Json(job).into_response())
}

async fn handle_job_action(
    State(state): State<AppState>,
    Extension(ids): Extension<TurnIds>,
    Path((job_id, action)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let action = match action.as_str() {
        "pause" => AdminAction::Pause,
        "resume" => AdminAction::Resume,
        "retry" => AdminAction::Retry,
        other => return Err(AppError::not_found(format!("unknown job action: {}", other), &ids)),
    };
    let job = state
        .jobs
        .admin(&job_id, action)
        .await
        .map_err(|e| AppError::admin(e, &ids))?;
    Ok(Json(job).into_response())
}

// ============ GET /internal/metrics, /health ============

async fn handle_metrics(State(state): State<AppState>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

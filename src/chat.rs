//! Chat turn orchestration.
//!
//! [`ChatService::handle_turn`] runs one user turn end to end:
//!
//! 1. Validate the request (message length, history length, session id).
//! 2. Load the session; a store failure degrades to a fresh in-memory state.
//! 3. Understand the message and let the policy engine pick a route.
//! 4. Try the tool path ([`ToolRouter`](crate::tools::ToolRouter)).
//! 5. Otherwise answer from retrieval: budget check, retrieve, grounded
//!    prompt, LLM gateway, citation validation, output guard.
//! 6. Apply the claim guard, update fallback bookkeeping, persist the
//!    session patch, turn events and audit rows, and record metrics.
//!
//! [`ChatService::handle_turn_stream`] is the same pipeline with the LLM
//! answer forwarded as it arrives; the final `done` event carries the fully
//! validated response envelope.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_stream::stream;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use shelf_core::cache::Cache;
use shelf_core::guard::{
    apply_claim_guard, risk_band, validate_citations, violates_output_guard, ClaimContext,
    Evidence, SAFE_GENERIC_MESSAGE,
};
use shelf_core::intent::understand;
use shelf_core::metrics::Metrics;
use shelf_core::models::{
    ActionAudit, ChatMessage, ChatOptions, ChatRequest, ChatResponse, FieldPatch, PolicyDecision,
    Reply, RiskBand, SessionPatch, SessionState, ToolUnderstanding, TurnEvent,
    UnresolvedContext, EVENT_ASSISTANT_RESPONSE, EVENT_POLICY_DECISION, EVENT_USER_MESSAGE,
};
use shelf_core::policy::{decide, SessionFlags};
use shelf_core::reason::{self, recovery_hint, ChatStatus, NextAction};
use shelf_core::redact::Redactor;
use shelf_core::routing::RoutePlan;
use shelf_core::store::{RetentionOptions, RetentionReport, SessionStore};

use crate::commerce::CommerceClient;
use crate::config::{Config, LogMessageMode};
use crate::guardrails::Guardrails;
use crate::llm::{GenerateRequest, GenerateResponse, LlmError, LlmEvent, LlmGateway};
use crate::model_service::ModelServiceClient;
use crate::rag::{Chunk, Retrieval, RetrieveOptions, Retriever};
use crate::tools::{ToolContext, ToolOutcome, ToolRouter};

const PREVIEW_CHARS: usize = 120;
const HISTORY_TAIL: usize = 6;

const SYSTEM_PROMPT: &str = "당신은 온라인 서점의 도서 안내 도우미입니다. \
아래 근거 목록에 있는 내용만 사용해 답하고, 사용한 근거의 citation key를 citations에 모두 담으세요. \
근거로 답할 수 없으면 모른다고 답하세요. 주문 처리나 환불 결과를 단정하지 마세요.";

const VALIDATION_ROUTE: &str = "VALIDATE";
const RAG_ROUTE: &str = "RAG";

/// Correlation ids for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnIds {
    pub trace_id: String,
    pub request_id: String,
}

impl TurnIds {
    pub fn new(trace_id: Option<String>, request_id: Option<String>) -> Self {
        let fresh = || uuid::Uuid::new_v4().simple().to_string();
        Self {
            trace_id: trace_id.filter(|t| !t.trim().is_empty()).unwrap_or_else(fresh),
            request_id: request_id.filter(|r| !r.trim().is_empty()).unwrap_or_else(fresh),
        }
    }
}

/// One SSE event of a streamed turn.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Meta(Value),
    Delta(String),
    Done(Box<ChatResponse>),
    Error { code: String, message: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Meta(_) => "meta",
            StreamEvent::Delta(_) => "delta",
            StreamEvent::Done(_) => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            StreamEvent::Meta(meta) => meta.clone(),
            StreamEvent::Delta(text) => json!({ "delta": text }),
            StreamEvent::Done(response) => serde_json::to_value(response.as_ref()).unwrap_or(Value::Null),
            StreamEvent::Error { code, message } => json!({ "code": code, "message": message }),
        }
    }
}

/// Counts streams dropped before their final event.
struct CancelGuard {
    metrics: Arc<Metrics>,
    completed: bool,
}

impl CancelGuard {
    fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.metrics.inc(
                "chat_stream_cancelled_total",
                &[("reason", reason::PROVIDER_TIMEOUT)],
            );
            tracing::info!("chat stream cancelled by client");
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainRequest {
    pub query: String,
    #[serde(default)]
    pub top_n: Option<usize>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub rerank: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub understanding: ToolUnderstanding,
    pub decision: PolicyDecision,
    pub retrieval: Retrieval,
    pub route_plan: RoutePlan,
}

/// A validated turn with its session and routing decision.
struct Turn {
    ids: TurnIds,
    session_id: String,
    user_id: Option<String>,
    admin_id: Option<String>,
    message: String,
    history: Vec<ChatMessage>,
    options: ChatOptions,
    session: SessionState,
    understanding: ToolUnderstanding,
    decision: PolicyDecision,
    now: DateTime<Utc>,
}

impl Turn {
    fn tool_context(&self) -> ToolContext<'_> {
        ToolContext {
            conversation_id: &self.session_id,
            user_id: self.user_id.as_deref(),
            admin_id: self.admin_id.as_deref(),
            tenant_id: &self.session.tenant_id,
            trace_id: &self.ids.trace_id,
            request_id: &self.ids.request_id,
            message: &self.message,
            history: &self.history,
            session: &self.session,
            understanding: &self.understanding,
            decision: &self.decision,
            now: self.now,
        }
    }
}

/// Everything needed to call the gateway for a retrieval answer.
struct Grounded {
    retrieval: Retrieval,
    request: GenerateRequest,
    plan: RoutePlan,
}

/// How a turn ended, before bookkeeping.
struct Finish {
    reply: Reply,
    patch: SessionPatch,
    audits: Vec<ActionAudit>,
    route: &'static str,
    source: &'static str,
    claim: ClaimContext,
    provider_error: bool,
}

impl Finish {
    fn rag(reply: Reply, provider_error: bool) -> Self {
        Self {
            reply,
            patch: SessionPatch::default(),
            audits: Vec::new(),
            route: RAG_ROUTE,
            source: "rag",
            claim: ClaimContext::default(),
            provider_error,
        }
    }

    fn tool(route: &'static str, outcome: ToolOutcome) -> Self {
        Self {
            claim: ClaimContext {
                tool_succeeded: outcome.tool_succeeded,
                awaiting_confirmation: outcome.awaiting_confirmation,
            },
            reply: outcome.reply,
            patch: outcome.patch,
            audits: outcome.audits,
            route,
            source: "tool",
            provider_error: false,
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn evidence_of(chunks: &[Chunk]) -> Vec<Evidence> {
    chunks
        .iter()
        .map(|c| Evidence {
            chunk_id: c.chunk_id.clone(),
            citation_key: c.citation_key.clone(),
        })
        .collect()
}

/// System instruction, numbered evidence, history tail, user message.
fn grounded_messages(chunks: &[Chunk], history: &[ChatMessage], message: &str) -> Vec<ChatMessage> {
    let mut evidence = String::from("근거 목록:\n");
    for (i, chunk) in chunks.iter().enumerate() {
        evidence.push_str(&format!(
            "[{}] citation_key={} chunk_id={} | {}\n{}\n",
            i + 1,
            chunk.citation_key,
            chunk.chunk_id,
            chunk.title,
            chunk.snippet
        ));
    }
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::system(evidence)];
    let tail = history.len().saturating_sub(HISTORY_TAIL);
    messages.extend(
        history[tail..]
            .iter()
            .filter(|m| m.role == "user" || m.role == "assistant")
            .cloned(),
    );
    messages.push(ChatMessage::user(message));
    messages
}

fn failure_text(code: &str) -> &'static str {
    match code {
        reason::RAG_NO_CHUNKS => "관련 자료를 찾지 못했습니다. 질문을 조금 더 구체적으로 적어 주세요.",
        reason::RAG_RETRIEVE_ERROR => "자료 검색 중 문제가 발생했습니다. 잠시 후 다시 시도해 주세요.",
        reason::LLM_NO_CITATIONS | reason::LLM_LOW_CITATION_COVERAGE => {
            "근거를 충분히 확인하지 못해 답변을 드리기 어렵습니다. 질문을 바꿔 다시 시도해 주세요."
        }
        reason::PROVIDER_TIMEOUT => "답변 생성이 지연되고 있습니다. 잠시 후 다시 시도해 주세요.",
        reason::LLM_CALL_RATE_LIMITED => "요청이 너무 많습니다. 잠시 후 다시 시도해 주세요.",
        reason::MISSING_INPUT => "메시지를 입력해 주세요.",
        reason::CHAT_MESSAGE_TOO_LONG => "메시지가 너무 깁니다. 짧게 나눠서 보내 주세요.",
        reason::CHAT_HISTORY_TOO_LONG => "대화 기록이 너무 깁니다. 새 대화를 시작해 주세요.",
        reason::CHAT_INVALID_SESSION_ID => "세션 정보가 올바르지 않습니다. 새 대화를 시작해 주세요.",
        _ => "일시적인 오류로 답변을 드리지 못했습니다. 잠시 후 다시 시도해 주세요.",
    }
}

fn is_failure(status: ChatStatus) -> bool {
    matches!(status, ChatStatus::ToolFallback | ChatStatus::InsufficientEvidence)
}

#[derive(Clone)]
pub struct ChatService {
    config: Arc<Config>,
    store: Arc<dyn SessionStore>,
    router: ToolRouter,
    retriever: Retriever,
    gateway: LlmGateway,
    guardrails: Guardrails,
    redactor: Redactor,
    metrics: Arc<Metrics>,
    session_id_re: Regex,
}

impl ChatService {
    pub fn new(
        config: &Config,
        store: Arc<dyn SessionStore>,
        cache: Arc<dyn Cache>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let session_id_re = Regex::new(&config.chat.session_id_regex)
            .with_context(|| format!("invalid chat.session_id_regex: {}", config.chat.session_id_regex))?;
        let guardrails = Guardrails::new(cache.clone(), &config.tools, &config.chat);
        let retriever = Retriever::new(
            &config.rag,
            ModelServiceClient::new(&config.model_service),
            metrics.clone(),
        );
        let router = ToolRouter::new(
            CommerceClient::new(&config.tools),
            guardrails.clone(),
            retriever.clone(),
            metrics.clone(),
            &config.tools,
        );
        let gateway = LlmGateway::new(&config.llm, cache, metrics.clone())?;
        Ok(Self {
            config: Arc::new(config.clone()),
            store,
            router,
            retriever,
            gateway,
            guardrails,
            redactor: Redactor::with_metrics(metrics.clone()),
            metrics,
            session_id_re,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    fn degraded(&self, op: &str, err: &anyhow::Error) {
        self.metrics.inc("chat_session_degraded_total", &[("op", op)]);
        tracing::warn!(op, error = %err, "session store unavailable; continuing degraded");
    }

    // ============ Turn setup ============

    fn validate(&self, request: &ChatRequest, session_id: &str) -> Option<&'static str> {
        let content = request.message.content.trim();
        if content.is_empty() {
            Some(reason::MISSING_INPUT)
        } else if content.chars().count() > self.config.chat.max_message_chars {
            Some(reason::CHAT_MESSAGE_TOO_LONG)
        } else if request.history.len() > self.config.chat.max_history_turns {
            Some(reason::CHAT_HISTORY_TOO_LONG)
        } else if !self.session_id_re.is_match(session_id) {
            Some(reason::CHAT_INVALID_SESSION_ID)
        } else {
            None
        }
    }

    fn reject(&self, code: &str, ids: &TurnIds, session_id: &str) -> ChatResponse {
        let reply = Reply::new(code, failure_text(code));
        let response = ChatResponse::from_reply(reply, &ids.trace_id, &ids.request_id, session_id, RiskBand::R1);
        self.count_response(&response, VALIDATION_ROUTE, "validation");
        response
    }

    async fn load_session(&self, session_id: &str, now: DateTime<Utc>) -> SessionState {
        let tenant = &self.config.session.tenant_id;
        match self.store.get(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => SessionState::new(session_id, tenant, now),
            Err(err) => {
                self.degraded("read", &err);
                SessionState::new(session_id, tenant, now)
            }
        }
    }

    fn message_payload(&self, message: &str) -> Value {
        match self.config.session.log_message_mode {
            LogMessageMode::MaskedRaw => json!({ "content": self.redactor.redact(message) }),
            LogMessageMode::HashSummary => json!({
                "sha256": hex::encode(Sha256::digest(message.as_bytes())),
                "length": message.chars().count(),
            }),
        }
    }

    async fn append_event(&self, turn: &Turn, event_type: &str, route: Option<&str>, reason_code: Option<&str>, payload: Value) {
        let event = TurnEvent {
            conversation_id: turn.session_id.clone(),
            turn_id: turn.ids.request_id.clone(),
            event_type: event_type.to_string(),
            route: route.map(str::to_string),
            reason_code: reason_code.map(str::to_string),
            trace_id: Some(turn.ids.trace_id.clone()),
            request_id: Some(turn.ids.request_id.clone()),
            payload,
            event_time: Utc::now(),
        };
        if let Err(err) = self.store.append_turn_event(event).await {
            self.degraded("append_event", &err);
        }
    }

    /// Validate, load the session, understand and decide.
    async fn begin(&self, request: ChatRequest, ids: &TurnIds) -> std::result::Result<Turn, ChatResponse> {
        let session_id = request
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Some(code) = self.validate(&request, &session_id) {
            tracing::info!(reason = code, trace_id = %ids.trace_id, "chat request rejected");
            return Err(self.reject(code, ids, &session_id));
        }

        let now = Utc::now();
        let session = self.load_session(&session_id, now).await;
        let user_id = request.client.user_id.filter(|u| !u.trim().is_empty());
        let message = request.message.content.trim().to_string();
        let understanding = understand(&message);
        let decision = decide(
            &understanding,
            &SessionFlags {
                has_user: user_id.is_some(),
                has_pending_action: session.pending_action.is_some(),
                has_selection: session.selection.is_some(),
            },
        );
        tracing::info!(
            session_id = %session_id,
            trace_id = %ids.trace_id,
            intent = understanding.intent.as_str(),
            route = decision.route.as_str(),
            reason = %decision.reason_code,
            "chat turn routed"
        );

        let turn = Turn {
            ids: ids.clone(),
            session_id,
            user_id,
            admin_id: request.client.admin_id.filter(|a| !a.trim().is_empty()),
            message,
            history: request.history,
            options: request.options,
            session,
            understanding,
            decision,
            now,
        };
        self.append_event(&turn, EVENT_USER_MESSAGE, None, None, self.message_payload(&turn.message))
            .await;
        self.append_event(
            &turn,
            EVENT_POLICY_DECISION,
            Some(turn.decision.route.as_str()),
            Some(turn.decision.reason_code.as_str()),
            json!({
                "intent": turn.understanding.intent.as_str(),
                "policy_rule_id": turn.decision.policy_rule_id,
                "missing_slots": turn.decision.missing_slots,
                "q_key": turn.understanding.q_key,
            }),
        )
        .await;
        Ok(turn)
    }

    // ============ Retrieval answer ============

    /// Budget check, retrieval, prompt and route plan. An `Err` is the
    /// reply to send instead of calling the LLM.
    async fn ground(&self, turn: &Turn) -> std::result::Result<Grounded, Reply> {
        if let Err(retry_after_ms) = self.guardrails.consume_llm_budget(&turn.session_id).await {
            return Err(Reply::new(
                reason::LLM_CALL_RATE_LIMITED,
                failure_text(reason::LLM_CALL_RATE_LIMITED),
            )
            .with_retry_after(retry_after_ms));
        }

        let options = RetrieveOptions {
            top_n: None,
            top_k: turn.options.top_k,
            rerank: turn.options.rerank,
        };
        let retrieval = self
            .retriever
            .retrieve(&turn.understanding.standalone_query, options)
            .await;
        if let Some(code) = retrieval.error {
            return Err(Reply::new(code, failure_text(code)));
        }
        if retrieval.is_empty() {
            return Err(Reply::new(reason::RAG_NO_CHUNKS, failure_text(reason::RAG_NO_CHUNKS)));
        }

        let request = GenerateRequest {
            messages: grounded_messages(&retrieval.chunks, &turn.history, &turn.message),
            trace_id: turn.ids.trace_id.clone(),
            request_id: turn.ids.request_id.clone(),
        };
        let plan = self
            .gateway
            .plan(Some(turn.understanding.intent.as_str()), &turn.understanding.standalone_query)
            .await;
        Ok(Grounded {
            retrieval,
            request,
            plan,
        })
    }

    /// Citation validation and output guard over a generated answer.
    fn check_generated(&self, turn: &Turn, retrieval: &Retrieval, generated: GenerateResponse, high_risk: bool) -> Reply {
        let check = validate_citations(
            &generated.citations,
            &evidence_of(&retrieval.chunks),
            self.config.chat.min_coverage_ratio,
        );
        if let Some(code) = check.reason {
            tracing::info!(
                reason = code,
                coverage = check.coverage,
                trace_id = %turn.ids.trace_id,
                "llm answer rejected by citation check"
            );
            return Reply::new(code, failure_text(code));
        }
        if violates_output_guard(&generated.content, high_risk, &self.config.chat.forbidden_claims) {
            tracing::info!(trace_id = %turn.ids.trace_id, "llm answer hit output guard");
            return Reply::new(reason::OUTPUT_GUARD_FORBIDDEN_CLAIM, SAFE_GENERIC_MESSAGE);
        }
        let sources = check.cited.iter().map(|&i| retrieval.chunks[i].to_source()).collect();
        let mut reply = Reply::ok(generated.content).with_sources(sources);
        reply.citations = check.valid;
        reply
    }

    fn provider_failure(err: &LlmError) -> Reply {
        let code = err.reason_code();
        Reply::new(code, failure_text(code))
    }

    async fn answer(&self, turn: &Turn) -> Finish {
        let grounded = match self.ground(turn).await {
            Ok(grounded) => grounded,
            Err(reply) => return Finish::rag(reply, false),
        };
        match self.gateway.generate(&grounded.request, &grounded.plan).await {
            Ok(generated) => {
                tracing::debug!(provider = %generated.provider, "llm answered");
                let reply = self.check_generated(turn, &grounded.retrieval, generated.response, grounded.plan.high_risk);
                Finish::rag(reply, false)
            }
            Err(err) => Finish::rag(ChatService::provider_failure(&err), true),
        }
    }

    // ============ Turn completion ============

    fn count_response(&self, response: &ChatResponse, route: &str, source: &str) {
        self.metrics.inc(
            "chat_turn_total",
            &[("route", route), ("status", response.status.as_str())],
        );
        self.metrics
            .inc("chat_risk_band_total", &[("band", response.risk_band.as_str())]);
        if !response.status.is_ok() {
            self.metrics.inc(
                "chat_error_recovery_hint_total",
                &[
                    ("reason_code", response.reason_code.as_str()),
                    ("next_action", response.next_action.as_str()),
                    ("source", source),
                ],
            );
        }
    }

    /// Guard the reply, persist the turn and build the response envelope.
    async fn finish(&self, turn: Turn, finish: Finish) -> ChatResponse {
        let mut reply = apply_claim_guard(finish.reply, finish.claim);
        let hint = recovery_hint(&reply.reason_code);
        let ok = hint.status.is_ok();

        let mut bookkeeping = SessionPatch {
            user_id: turn.user_id.clone(),
            last_turn_id: Some(turn.ids.request_id.clone()),
            last_trace_id: Some(turn.ids.trace_id.clone()),
            last_request_id: Some(turn.ids.request_id.clone()),
            expires_at: FieldPatch::Set(turn.now + Duration::days(self.config.session.session_ttl_days)),
            ..Default::default()
        };
        if ok {
            bookkeeping.fallback_count = Some(0);
            bookkeeping.unresolved_context = FieldPatch::Clear;
            bookkeeping.summary_short =
                FieldPatch::Set(truncate_chars(&turn.understanding.standalone_query, PREVIEW_CHARS));
        } else if is_failure(hint.status) {
            let count = turn.session.fallback_count + 1;
            bookkeeping.fallback_count = Some(count);
            let next = reply.next_action.unwrap_or(hint.next_action);
            if count >= self.config.chat.fallback_escalate_threshold && next == NextAction::Retry {
                reply.next_action = Some(NextAction::OpenSupportTicket);
            }
            bookkeeping.unresolved_context = FieldPatch::Set(UnresolvedContext {
                reason_code: reply.reason_code.clone(),
                query_preview: truncate_chars(&self.redactor.redact(&turn.message), PREVIEW_CHARS),
                next_action: reply.next_action.unwrap_or(hint.next_action),
                trace_id: Some(turn.ids.trace_id.clone()),
                request_id: Some(turn.ids.request_id.clone()),
                updated_at: turn.now,
            });
        }

        let high_risk = shelf_core::routing::is_high_risk(&turn.message, &self.config.llm.risk_high_keywords);
        let band = risk_band(finish.provider_error, ok, high_risk, !reply.citations.is_empty());
        let response = ChatResponse::from_reply(reply, &turn.ids.trace_id, &turn.ids.request_id, &turn.session_id, band);

        let patch = finish.patch.merge(bookkeeping);
        if let Err(err) = self
            .store
            .upsert(&turn.session_id, &turn.session.tenant_id, patch)
            .await
        {
            self.degraded("write", &err);
        }
        for audit in finish.audits {
            if let Err(err) = self.store.append_action_audit(audit).await {
                self.degraded("audit", &err);
            }
        }
        self.append_event(
            &turn,
            EVENT_ASSISTANT_RESPONSE,
            Some(finish.route),
            Some(response.reason_code.as_str()),
            json!({
                "status": response.status.as_str(),
                "citations": response.citations,
                "risk_band": response.risk_band.as_str(),
                "next_action": response.next_action.as_str(),
            }),
        )
        .await;

        self.count_response(&response, finish.route, finish.source);
        tracing::info!(
            session_id = %turn.session_id,
            trace_id = %turn.ids.trace_id,
            status = response.status.as_str(),
            reason = %response.reason_code,
            "chat turn finished"
        );
        response
    }

    // ============ Public operations ============

    pub async fn handle_turn(&self, request: ChatRequest, ids: &TurnIds) -> ChatResponse {
        let turn = match self.begin(request, ids).await {
            Ok(turn) => turn,
            Err(response) => return response,
        };
        let finish = match self.router.route(&turn.tool_context()).await {
            Some(outcome) => Finish::tool(turn.decision.route.as_str(), outcome),
            None => self.answer(&turn).await,
        };
        self.finish(turn, finish).await
    }

    pub fn handle_turn_stream(&self, request: ChatRequest, ids: TurnIds) -> BoxStream<'static, StreamEvent> {
        let service = self.clone();
        let meta = |session_id: &str, route: &str, ids: &TurnIds| {
            StreamEvent::Meta(json!({
                "trace_id": ids.trace_id,
                "request_id": ids.request_id,
                "session_id": session_id,
                "route": route,
            }))
        };
        stream! {
            let mut guard = CancelGuard::new(service.metrics.clone());
            match service.begin(request, &ids).await {
                Err(response) => {
                    yield meta(&response.session_id, VALIDATION_ROUTE, &ids);
                    guard.complete();
                    yield StreamEvent::Done(Box::new(response));
                }
                Ok(turn) => {
                    let routed = service.router.route(&turn.tool_context()).await;
                    let route = match &routed {
                        Some(_) => turn.decision.route.as_str(),
                        None => RAG_ROUTE,
                    };
                    yield meta(&turn.session_id, route, &ids);

                    if let Some(outcome) = routed {
                        let finish = Finish::tool(turn.decision.route.as_str(), outcome);
                        let response = service.finish(turn, finish).await;
                        yield StreamEvent::Delta(response.answer.content.clone());
                        guard.complete();
                        yield StreamEvent::Done(Box::new(response));
                    } else {
                        match service.ground(&turn).await {
                            Err(reply) => {
                                let response = service.finish(turn, Finish::rag(reply, false)).await;
                                guard.complete();
                                yield StreamEvent::Done(Box::new(response));
                            }
                            Ok(grounded) => match service.gateway.generate_stream(&grounded.request, &grounded.plan).await {
                                Err(err) => {
                                    let response = service
                                        .finish(turn, Finish::rag(ChatService::provider_failure(&err), true))
                                        .await;
                                    guard.complete();
                                    yield StreamEvent::Done(Box::new(response));
                                }
                                Ok(mut llm) => {
                                    let mut ended: Option<std::result::Result<GenerateResponse, LlmError>> = None;
                                    while let Some(event) = llm.events.next().await {
                                        match event {
                                            Ok(LlmEvent::Delta(text)) => yield StreamEvent::Delta(text),
                                            Ok(LlmEvent::Meta(_)) => {}
                                            Ok(LlmEvent::Done(done)) => {
                                                ended = Some(Ok(done));
                                                break;
                                            }
                                            Err(err) => {
                                                ended = Some(Err(err));
                                                break;
                                            }
                                        }
                                    }
                                    match ended.unwrap_or_else(|| Err(LlmError::Stream("stream ended without done".into()))) {
                                        Ok(done) => {
                                            let reply = service.check_generated(&turn, &grounded.retrieval, done, grounded.plan.high_risk);
                                            let response = service.finish(turn, Finish::rag(reply, false)).await;
                                            guard.complete();
                                            yield StreamEvent::Done(Box::new(response));
                                        }
                                        Err(err) => {
                                            tracing::warn!(provider = %llm.provider, error = %err, "llm stream failed after first delta");
                                            let response = service
                                                .finish(turn, Finish::rag(ChatService::provider_failure(&err), true))
                                                .await;
                                            guard.complete();
                                            yield StreamEvent::Error {
                                                code: response.reason_code.clone(),
                                                message: response.answer.content.clone(),
                                            };
                                        }
                                    }
                                }
                            },
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Understanding, decision, retrieval trace and route preview for a
    /// query, without calling the LLM.
    pub async fn explain(&self, request: &ExplainRequest) -> Result<Explanation> {
        if request.query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let understanding = understand(&request.query);
        let decision = decide(&understanding, &SessionFlags::default());
        let retrieval = self
            .retriever
            .retrieve(
                &understanding.standalone_query,
                RetrieveOptions {
                    top_n: request.top_n,
                    top_k: request.top_k,
                    rerank: request.rerank,
                },
            )
            .await;
        let route_plan = self
            .gateway
            .preview(Some(understanding.intent.as_str()), &understanding.standalone_query)
            .await;
        Ok(Explanation {
            understanding,
            decision,
            retrieval,
            route_plan,
        })
    }

    pub fn is_valid_session_id(&self, session_id: &str) -> bool {
        self.session_id_re.is_match(session_id)
    }

    pub async fn session_state(&self, session_id: &str) -> Result<Option<SessionState>> {
        self.store.get(session_id).await
    }

    pub async fn reset_session(&self, session_id: &str) -> Result<SessionState> {
        let state = self
            .store
            .reset(session_id, &self.config.session.tenant_id)
            .await
            .with_context(|| format!("failed to reset session {}", session_id))?;
        tracing::info!(session_id, version = state.state_version, "session reset");
        Ok(state)
    }

    pub async fn run_retention(&self, dry_run: bool) -> Result<RetentionReport> {
        let session = &self.config.session;
        let options = RetentionOptions {
            session_days: session.session_days,
            turn_event_days: session.turn_event_days,
            action_audit_days: session.action_audit_days,
            batch_size: session.retention_batch_size,
            max_batches: session.retention_max_batches,
            dry_run,
            now: Utc::now(),
        };
        let report = self.store.run_retention(&options).await?;
        tracing::info!(
            dry_run,
            sessions = report.sessions,
            turn_events = report.turn_events,
            action_audits = report.action_audits,
            "retention pass finished"
        );
        Ok(report)
    }
}

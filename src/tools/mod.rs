//! Intent-driven tool handlers.
//!
//! [`ToolRouter::route`] maps a policy decision onto a handler. It returns
//! `None` when the turn belongs to the retrieval path (general questions),
//! otherwise a [`ToolOutcome`]: the reply, the session patch the handler
//! wants persisted, and any audit rows.
//!
//! | Route | Handler |
//! |-------|---------|
//! | ASK | login / slot prompt |
//! | OPTIONS | disambiguation or candidate actions |
//! | CONFIRM | [`workflow`] (start or continue a sensitive write) |
//! | EXECUTE | [`order`], [`ticket`], [`recommend`] (cart) |
//! | ANSWER | [`policy_topic`], [`recommend`] (book); otherwise retrieval |
//!
//! Every commerce call goes through [`ToolRouter::call`], which applies the
//! per-tool circuit breaker.

pub mod order;
pub mod policy_topic;
pub mod recommend;
pub mod ticket;
pub mod workflow;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use shelf_core::metrics::Metrics;
use shelf_core::models::{
    ActionAudit, AuditDecision, AuditResult, ChatMessage, Intent, PolicyDecision, Reply, Route,
    SessionPatch, SessionState, ToolUnderstanding,
};
use shelf_core::policy::NEED_AUTH_USER_LOGIN;
use shelf_core::reason::{self, NextAction};

use crate::commerce::{CallContext, CommerceClient, CommerceError};
use crate::config::ToolsConfig;
use crate::guardrails::Guardrails;
use crate::rag::Retriever;

use self::policy_topic::PolicyTopics;

/// Everything a handler may read about the current turn.
pub struct ToolContext<'a> {
    pub conversation_id: &'a str,
    pub user_id: Option<&'a str>,
    pub admin_id: Option<&'a str>,
    pub tenant_id: &'a str,
    pub trace_id: &'a str,
    pub request_id: &'a str,
    pub message: &'a str,
    pub history: &'a [ChatMessage],
    pub session: &'a SessionState,
    pub understanding: &'a ToolUnderstanding,
    pub decision: &'a PolicyDecision,
    pub now: DateTime<Utc>,
}

impl ToolContext<'_> {
    pub fn call_context(&self) -> CallContext {
        CallContext {
            user_id: self.user_id.map(str::to_string),
            tenant_id: self.tenant_id.to_string(),
            trace_id: self.trace_id.to_string(),
            request_id: self.request_id.to_string(),
        }
    }

    /// Audit row pre-filled with actor and correlation ids.
    pub fn audit(
        &self,
        action_type: &str,
        action_state: &str,
        decision: AuditDecision,
        result: AuditResult,
        reason_code: &str,
    ) -> ActionAudit {
        let mut audit = ActionAudit::new(
            self.conversation_id,
            action_type,
            action_state,
            decision,
            result,
            reason_code,
        );
        audit.actor_user_id = self.user_id.map(str::to_string);
        audit.actor_admin_id = self.admin_id.map(str::to_string);
        audit.auth_context = serde_json::json!({
            "user_id": self.user_id,
            "admin_id": self.admin_id,
            "tenant_id": self.tenant_id,
        });
        audit.trace_id = Some(self.trace_id.to_string());
        audit.request_id = Some(self.request_id.to_string());
        audit.event_time = self.now;
        audit
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub reply: Reply,
    pub patch: SessionPatch,
    pub audits: Vec<ActionAudit>,
    /// The tool call this turn completed successfully.
    pub tool_succeeded: bool,
    /// A sensitive action is waiting for its confirmation token.
    pub awaiting_confirmation: bool,
}

impl ToolOutcome {
    pub fn reply(reply: Reply) -> Self {
        Self {
            reply,
            patch: SessionPatch::default(),
            audits: Vec::new(),
            tool_succeeded: false,
            awaiting_confirmation: false,
        }
    }

    pub fn succeeded(reply: Reply) -> Self {
        Self {
            tool_succeeded: true,
            ..Self::reply(reply)
        }
    }

    pub fn with_patch(mut self, patch: SessionPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn with_audit(mut self, audit: ActionAudit) -> Self {
        self.audits.push(audit);
        self
    }
}

/// Why a guarded tool call did not produce a value.
#[derive(Debug)]
pub enum ToolFailure {
    Commerce(CommerceError),
    CircuitOpen { retry_after_ms: u64 },
}

impl ToolFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ToolFailure::Commerce(err) => err.reason_code(),
            ToolFailure::CircuitOpen { .. } => reason::TOOL_CIRCUIT_OPEN,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ToolFailure::Commerce(err) => err.status(),
            ToolFailure::CircuitOpen { .. } => None,
        }
    }
}

/// User-facing text for a failed tool call.
pub fn failure_message(code: &str) -> &'static str {
    match code {
        reason::RESOURCE_NOT_FOUND => "요청하신 정보를 찾을 수 없습니다. 번호를 다시 확인해 주세요.",
        reason::AUTH_FORBIDDEN => "해당 정보에 접근할 권한이 없습니다.",
        reason::TOOL_TIMEOUT => "주문 시스템 응답이 지연되고 있습니다. 잠시 후 다시 시도해 주세요.",
        reason::TOOL_CIRCUIT_OPEN => "주문 시스템이 일시적으로 불안정합니다. 잠시 후 다시 시도해 주세요.",
        reason::RATE_LIMITED => "요청이 너무 많습니다. 잠시 후 다시 시도해 주세요.",
        reason::MISSING_REQUIRED_INFO => "요청을 처리하기 위한 정보가 부족합니다.",
        _ => "일시적인 오류로 요청을 처리하지 못했습니다. 잠시 후 다시 시도해 주세요.",
    }
}

pub fn failure_reply(failure: &ToolFailure) -> Reply {
    let code = failure.reason_code();
    let reply = Reply::new(code, failure_message(code));
    match failure {
        ToolFailure::CircuitOpen { retry_after_ms } => reply.with_retry_after(*retry_after_ms),
        _ => reply,
    }
}

const OPTIONS_MESSAGE: &str = "어떤 도움이 필요하신지 알려 주세요. 주문 조회, 배송 조회, 환불 조회, \
주문 취소, 환불 신청, 문의 접수 중에서 선택하실 수 있습니다.";
const DISAMBIGUATE_MESSAGE: &str =
    "어떤 책을 말씀하시는지 알 수 없습니다. 먼저 추천 목록을 요청하시거나 책 제목을 알려 주세요.";
const LOGIN_MESSAGE: &str = "로그인 후 이용하실 수 있습니다. 로그인한 뒤 다시 요청해 주세요.";
const ORDER_REF_MESSAGE: &str = "주문번호를 알려 주세요. 예: 주문 12";

#[derive(Clone)]
pub struct ToolRouter {
    pub(crate) commerce: CommerceClient,
    pub(crate) guardrails: Guardrails,
    pub(crate) retriever: Retriever,
    pub(crate) topics: PolicyTopics,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) config: ToolsConfig,
}

impl ToolRouter {
    pub fn new(
        commerce: CommerceClient,
        guardrails: Guardrails,
        retriever: Retriever,
        metrics: Arc<Metrics>,
        config: &ToolsConfig,
    ) -> Self {
        Self {
            topics: PolicyTopics::new(guardrails.cache().clone(), metrics.clone()),
            commerce,
            guardrails,
            retriever,
            metrics,
            config: config.clone(),
        }
    }

    /// Run `call` unless the tool's circuit is open; timeouts feed the
    /// breaker and successes reset it.
    pub(crate) async fn call<T, F>(&self, tool: &str, call: F) -> Result<T, ToolFailure>
    where
        F: Future<Output = Result<T, CommerceError>>,
    {
        if let Some(retry_after_ms) = self.guardrails.circuit_open(tool).await {
            self.metrics.inc("chat_tool_circuit_open_total", &[("tool", tool)]);
            return Err(ToolFailure::CircuitOpen { retry_after_ms });
        }
        match call.await {
            Ok(value) => {
                self.guardrails.record_tool_success(tool).await;
                Ok(value)
            }
            Err(err) => {
                if err.is_timeout() {
                    self.guardrails.record_tool_timeout(tool).await;
                }
                self.metrics.inc(
                    "chat_tool_error_total",
                    &[("tool", tool), ("reason", err.reason_code())],
                );
                tracing::warn!(tool, error = %err, "tool call failed");
                Err(ToolFailure::Commerce(err))
            }
        }
    }

    /// Failure outcome; circuit rejections are audited as `BLOCKED`.
    pub(crate) fn failure_outcome(&self, ctx: &ToolContext<'_>, tool: &str, failure: &ToolFailure) -> ToolOutcome {
        let outcome = ToolOutcome::reply(failure_reply(failure));
        match failure {
            ToolFailure::CircuitOpen { .. } => outcome.with_audit(ctx.audit(
                tool,
                "BLOCKED",
                AuditDecision::Blocked,
                AuditResult::Fail,
                reason::TOOL_CIRCUIT_OPEN,
            )),
            ToolFailure::Commerce(_) => outcome,
        }
    }

    pub async fn route(&self, ctx: &ToolContext<'_>) -> Option<ToolOutcome> {
        let intent = ctx.understanding.intent;
        match ctx.decision.route {
            Route::Ask => Some(ask(ctx.decision)),
            Route::Options => Some(ToolOutcome::reply(
                if ctx.decision.policy_rule_id == "policy.disambiguate" {
                    Reply::new(reason::MISSING_REQUIRED_INFO, DISAMBIGUATE_MESSAGE)
                } else {
                    Reply::new(reason::MISSING_REQUIRED_INFO, OPTIONS_MESSAGE)
                },
            )),
            Route::Confirm => Some(match ctx.session.pending_action.as_ref() {
                Some(pending) => workflow::continue_pending(self, ctx, pending).await,
                None => workflow::start(self, ctx).await,
            }),
            Route::Execute => Some(match intent {
                Intent::OrderLookup | Intent::ShipmentLookup | Intent::RefundLookup => {
                    order::lookup(self, ctx).await
                }
                Intent::TicketCreate => ticket::create(self, ctx).await,
                Intent::TicketStatus => ticket::status(self, ctx).await,
                Intent::TicketList => ticket::list(self, ctx).await,
                Intent::CartRecommend => recommend::cart(self, ctx).await,
                _ => ToolOutcome::reply(Reply::new(reason::MISSING_REQUIRED_INFO, OPTIONS_MESSAGE)),
            }),
            Route::Answer => match intent {
                Intent::RefundPolicy | Intent::ShippingPolicy | Intent::OrderPolicy => {
                    Some(policy_topic::answer(self, ctx).await)
                }
                Intent::BookRecommend => Some(recommend::book(self, ctx).await),
                _ => None,
            },
        }
    }
}

fn ask(decision: &PolicyDecision) -> ToolOutcome {
    let reply = if decision.reason_code == NEED_AUTH_USER_LOGIN {
        Reply::new(reason::AUTH_REQUIRED, LOGIN_MESSAGE)
    } else if decision.reason_code.starts_with(reason::NEED_SLOT_PREFIX) {
        Reply::new(&decision.reason_code, ORDER_REF_MESSAGE)
    } else {
        Reply::new(reason::MISSING_REQUIRED_INFO, OPTIONS_MESSAGE)
    };
    let next_action = if reply.reason_code == reason::AUTH_REQUIRED {
        NextAction::LoginRequired
    } else {
        NextAction::ProvideRequiredInfo
    };
    ToolOutcome::reply(reply.with_next_action(next_action))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use shelf_core::reason::ChatStatus;

    #[tokio::test]
    async fn test_ask_without_user_requires_login() {
        let router = router("http://127.0.0.1:9", "http://127.0.0.1:9", ToolsConfig::default());
        let turn = Turn::new("주문 12 상태 알려줘", None, session("s1"));
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::AUTH_REQUIRED);
        assert_eq!(outcome.reply.status(), ChatStatus::NeedsAuth);
        assert_eq!(outcome.reply.next_action, Some(NextAction::LoginRequired));
    }

    #[tokio::test]
    async fn test_missing_order_ref_asks_for_slot() {
        let router = router("http://127.0.0.1:9", "http://127.0.0.1:9", ToolsConfig::default());
        let turn = Turn::new("주문 취소해주세요", Some("1"), session("s1"));
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, "NEED_SLOT:ORDER_REF");
    }

    #[tokio::test]
    async fn test_general_question_goes_to_retrieval() {
        let router = router("http://127.0.0.1:9", "http://127.0.0.1:9", ToolsConfig::default());
        let turn = Turn::new("토지의 작가는 누구인가", Some("1"), session("s1"));
        assert!(router.route(&turn.ctx()).await.is_none());
    }
}

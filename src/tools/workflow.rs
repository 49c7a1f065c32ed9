//! Confirmation workflow for sensitive writes (order cancel, refund).
//!
//! ```text
//! start ──▶ AWAITING_CONFIRMATION ──token──▶ CONFIRMED ──▶ execute
//!                 │   ▲                                   │
//!        abort /  │   └──── FAILED_RETRYABLE ◀── 5xx ─────┤
//!        expiry   ▼                                       ▼
//!              cleared                      SUCCESS / FAILED (cleared)
//! ```
//!
//! The commerce mutation is only ever issued from [`execute`], and only
//! for a pending action in the `CONFIRMED` state. Retries reuse the
//! original idempotency key so the commerce side sees one logical write.

use chrono::Duration;
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use shelf_core::intent::is_abort;
use shelf_core::models::{
    ActionType, AuditDecision, AuditResult, FieldPatch, PendingAction, PendingState, Reply,
    SessionPatch, Source, SLOT_CONFIRM_TOKEN, SLOT_ORDER_REF,
};
use shelf_core::reason::{self, NextAction};

use super::{failure_reply, ToolContext, ToolFailure, ToolOutcome, ToolRouter};

const DEFAULT_REASON: &str = "고객 요청";

/// Six lowercase hex characters.
pub fn new_confirm_token() -> String {
    let value: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{:06x}", value)
}

pub fn idempotency_key(user_id: &str, action: ActionType, order_ref: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(order_ref.as_bytes());
    hasher.update(b"|");
    hasher.update(args.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("chat:{}:{}", action.as_str(), &digest[..16])
}

fn confirm_prompt(action: ActionType, order_ref: &str, token: &str, ttl_sec: i64) -> String {
    format!(
        "주문 {}에 대한 {}을(를) 진행하려면 {}분 안에 '확인 {}'을 입력해 주세요. 중단하려면 '그만'이라고 입력해 주세요.",
        order_ref,
        action.display_name(),
        (ttl_sec / 60).max(1),
        token
    )
}

fn cleared() -> SessionPatch {
    SessionPatch {
        pending_action: FieldPatch::Clear,
        ..Default::default()
    }
}

fn keep_pending(pending: PendingAction) -> SessionPatch {
    SessionPatch {
        pending_action: FieldPatch::Set(pending),
        ..Default::default()
    }
}

fn audit_for(
    ctx: &ToolContext<'_>,
    pending: &PendingAction,
    state: &str,
    decision: AuditDecision,
    result: AuditResult,
    reason_code: &str,
) -> shelf_core::models::ActionAudit {
    let mut audit = ctx.audit(pending.action_type.as_str(), state, decision, result, reason_code);
    audit.target_ref = pending.order_ref().map(str::to_string);
    audit.idempotency_key = Some(pending.idempotency_key.clone());
    audit.metadata = json!({ "retry_count": pending.retry_count });
    audit
}

/// Draft a pending action and ask the user for the token.
pub async fn start(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    let Some(action) = ctx.understanding.intent.action_type() else {
        return ToolOutcome::reply(Reply::new(reason::MISSING_REQUIRED_INFO, super::failure_message(reason::MISSING_REQUIRED_INFO)));
    };
    let (Some(user_id), Some(order_ref)) = (ctx.user_id, ctx.understanding.slot(SLOT_ORDER_REF)) else {
        return ToolOutcome::reply(Reply::new(
            &reason::need_slot(SLOT_ORDER_REF),
            "주문번호를 알려 주세요. 예: 주문 12",
        ));
    };

    let args = json!({ "order_ref": order_ref, "reason": DEFAULT_REASON });
    let ttl_sec = router.config.confirm_ttl_sec;
    let pending = PendingAction {
        action_type: action,
        state: PendingState::AwaitingConfirmation,
        idempotency_key: idempotency_key(user_id, action, order_ref, &args),
        confirm_token: new_confirm_token(),
        actor_user_id: Some(user_id.to_string()),
        expires_at: ctx.now + Duration::seconds(ttl_sec),
        args,
        retry_count: 0,
        created_at: ctx.now,
    };
    tracing::info!(
        action = action.as_str(),
        order_ref,
        conversation_id = ctx.conversation_id,
        trace_id = ctx.trace_id,
        "sensitive action awaiting confirmation"
    );

    let reply = Reply::new(
        reason::CONFIRMATION_REQUIRED,
        confirm_prompt(action, order_ref, &pending.confirm_token, ttl_sec),
    )
    .with_next_action(NextAction::ConfirmAction);
    let audit = audit_for(
        ctx,
        &pending,
        PendingState::AwaitingConfirmation.as_str(),
        AuditDecision::Allow,
        AuditResult::Pending,
        reason::CONFIRMATION_REQUIRED,
    );
    ToolOutcome {
        awaiting_confirmation: true,
        ..ToolOutcome::reply(reply)
    }
    .with_patch(keep_pending(pending))
    .with_audit(audit)
}

/// Advance an existing pending action with this turn's message.
pub async fn continue_pending(router: &ToolRouter, ctx: &ToolContext<'_>, pending: &PendingAction) -> ToolOutcome {
    if !pending.is_expired(ctx.now) && !pending.is_actor(ctx.user_id) {
        let code = if ctx.user_id.is_none() {
            reason::AUTH_REQUIRED
        } else {
            reason::AUTH_FORBIDDEN
        };
        tracing::warn!(
            action = pending.action_type.as_str(),
            conversation_id = ctx.conversation_id,
            trace_id = ctx.trace_id,
            "pending action touched by another caller"
        );
        let audit = audit_for(ctx, pending, pending.state.as_str(), AuditDecision::Deny, AuditResult::Fail, code);
        let reply = match code {
            reason::AUTH_REQUIRED => Reply::new(code, "로그인 후 요청을 확인할 수 있습니다.")
                .with_next_action(NextAction::LoginRequired),
            _ => Reply::new(code, super::failure_message(code)),
        };
        return ToolOutcome::reply(reply).with_audit(audit);
    }

    if is_abort(ctx.message) {
        let audit = audit_for(ctx, pending, "ABORTED", AuditDecision::Deny, AuditResult::Recorded, reason::USER_ABORTED);
        return ToolOutcome::reply(Reply::new(
            reason::USER_ABORTED,
            format!("{} 요청을 중단했습니다.", pending.action_type.display_name()),
        ))
        .with_patch(cleared())
        .with_audit(audit);
    }

    if pending.is_expired(ctx.now) {
        let audit = audit_for(ctx, pending, "EXPIRED", AuditDecision::Deny, AuditResult::Fail, reason::CONFIRMATION_EXPIRED);
        return ToolOutcome::reply(Reply::new(
            reason::CONFIRMATION_EXPIRED,
            "확인 시간이 지났습니다. 처음부터 다시 요청해 주세요.",
        ))
        .with_patch(cleared())
        .with_audit(audit);
    }

    let token = ctx.understanding.slot(SLOT_CONFIRM_TOKEN);
    if token != Some(pending.confirm_token.as_str()) {
        let audit = audit_for(
            ctx,
            pending,
            pending.state.as_str(),
            AuditDecision::Deny,
            AuditResult::Fail,
            reason::CONFIRMATION_REQUIRED,
        );
        let order_ref = pending.order_ref().unwrap_or_default();
        let reply = Reply::new(
            reason::CONFIRMATION_REQUIRED,
            format!(
                "확인 코드가 일치하지 않습니다. 주문 {}의 {}을(를) 진행하려면 안내된 확인 코드를 입력해 주세요.",
                order_ref,
                pending.action_type.display_name()
            ),
        )
        .with_next_action(NextAction::ConfirmAction);
        return ToolOutcome {
            awaiting_confirmation: true,
            ..ToolOutcome::reply(reply)
        }
        .with_audit(audit);
    }

    let confirmed = PendingAction {
        state: PendingState::Confirmed,
        ..pending.clone()
    };
    execute(router, ctx, confirmed).await
}

/// Issue the commerce mutation for a confirmed action.
pub async fn execute(router: &ToolRouter, ctx: &ToolContext<'_>, pending: PendingAction) -> ToolOutcome {
    if pending.state != PendingState::Confirmed {
        let audit = audit_for(
            ctx,
            &pending,
            pending.state.as_str(),
            AuditDecision::Deny,
            AuditResult::Fail,
            reason::DENY_EXECUTE_NOT_CONFIRMED,
        );
        return ToolOutcome {
            awaiting_confirmation: true,
            ..ToolOutcome::reply(Reply::new(
                reason::DENY_EXECUTE_NOT_CONFIRMED,
                "확인되지 않은 요청은 실행할 수 없습니다. 안내된 확인 코드를 입력해 주세요.",
            ))
        }
        .with_audit(audit);
    }

    let Some(order_ref) = pending.order_ref().map(str::to_string) else {
        return ToolOutcome::reply(Reply::new(
            &reason::need_slot(SLOT_ORDER_REF),
            "주문번호를 알려 주세요. 예: 주문 12",
        ))
        .with_patch(cleared());
    };
    let reason_text = pending
        .args
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_REASON)
        .to_string();
    let call = ctx.call_context();
    let tool = pending.action_type.as_str();

    let result = match pending.action_type {
        ActionType::OrderCancel => {
            router
                .call(
                    tool,
                    router
                        .commerce
                        .cancel_order(&order_ref, &reason_text, &call, &pending.idempotency_key),
                )
                .await
        }
        ActionType::RefundCreate => {
            router
                .call(
                    tool,
                    router
                        .commerce
                        .create_refund(&order_ref, &reason_text, &call, &pending.idempotency_key),
                )
                .await
        }
    };

    match result {
        Ok(_) => {
            router
                .metrics
                .inc("chat_sensitive_action_total", &[("action", tool), ("result", "success")]);
            let citation = match pending.action_type {
                ActionType::OrderCancel => format!("COMMERCE / orders/{}/cancel", order_ref),
                ActionType::RefundCreate => format!("COMMERCE / refunds/by-order/{}", order_ref),
            };
            let source = Source::new(citation, pending.action_type.display_name()).with_snippet("SUCCESS");
            let audit = audit_for(ctx, &pending, "SUCCESS", AuditDecision::Allow, AuditResult::Success, reason::OK);
            ToolOutcome::succeeded(
                Reply::ok(format!(
                    "주문 {}의 {}이(가) 완료되었습니다.",
                    order_ref,
                    pending.action_type.display_name()
                ))
                .with_sources(vec![source]),
            )
            .with_patch(cleared())
            .with_audit(audit)
        }
        Err(failure) => failed(router, ctx, pending, failure),
    }
}

fn failed(router: &ToolRouter, ctx: &ToolContext<'_>, pending: PendingAction, failure: ToolFailure) -> ToolOutcome {
    let tool = pending.action_type.as_str();
    let code = failure.reason_code();
    router
        .metrics
        .inc("chat_sensitive_action_total", &[("action", tool), ("result", code)]);

    let retryable = match &failure {
        ToolFailure::CircuitOpen { .. } => true,
        ToolFailure::Commerce(err) => err.retryable(),
    };
    if !retryable {
        // 403, 404 and other client errors end the workflow.
        let audit = audit_for(ctx, &pending, "FAILED", AuditDecision::Allow, AuditResult::Fail, code);
        return ToolOutcome::reply(failure_reply(&failure))
            .with_patch(cleared())
            .with_audit(audit);
    }

    let decision = match failure {
        ToolFailure::CircuitOpen { .. } => AuditDecision::Blocked,
        ToolFailure::Commerce(_) => AuditDecision::Allow,
    };
    if pending.retry_count >= router.config.max_retry {
        let audit = audit_for(ctx, &pending, "FAILED", decision, AuditResult::Fail, code);
        let reply = Reply::new(
            reason::TOOL_RETRYABLE_FAILURE,
            format!(
                "{}을(를) 여러 번 시도했지만 처리하지 못했습니다. 고객센터 문의를 남겨 주세요.",
                pending.action_type.display_name()
            ),
        )
        .with_next_action(NextAction::OpenSupportTicket);
        return ToolOutcome::reply(reply).with_patch(cleared()).with_audit(audit);
    }

    let retry = PendingAction {
        state: PendingState::FailedRetryable,
        retry_count: pending.retry_count + 1,
        ..pending
    };
    let audit = audit_for(
        ctx,
        &retry,
        PendingState::FailedRetryable.as_str(),
        decision,
        AuditResult::Fail,
        code,
    );
    let mut reply = failure_reply(&failure);
    reply.content.push_str(" 같은 확인 코드를 다시 입력하면 재시도합니다.");
    ToolOutcome {
        awaiting_confirmation: true,
        ..ToolOutcome::reply(reply)
    }
    .with_patch(keep_pending(retry))
    .with_audit(audit)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::ToolsConfig;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{header_regex, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Run the start turn and return the session with the drafted action.
    async fn started(router: &ToolRouter) -> (shelf_core::models::SessionState, PendingAction) {
        let turn = Turn::new("주문 12 취소해줘", Some("1"), session("s1"));
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::CONFIRMATION_REQUIRED);
        assert!(outcome.awaiting_confirmation);
        let FieldPatch::Set(pending) = outcome.patch.pending_action.clone() else {
            panic!("no pending action drafted");
        };
        let mut state = turn.session.clone();
        outcome.patch.apply(&mut state, Utc::now());
        (state, pending)
    }

    #[test]
    fn test_token_shape() {
        for _ in 0..50 {
            let token = new_confirm_token();
            assert_eq!(token.len(), 6);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let args = json!({"order_ref": "12"});
        let a = idempotency_key("1", ActionType::OrderCancel, "12", &args);
        let b = idempotency_key("1", ActionType::OrderCancel, "12", &args);
        assert_eq!(a, b);
        assert!(a.starts_with("chat:order_cancel:"));
        assert_eq!(a.len(), "chat:order_cancel:".len() + 16);
        assert_ne!(a, idempotency_key("2", ActionType::OrderCancel, "12", &args));
    }

    #[tokio::test]
    async fn test_matching_token_executes_once() {
        let commerce = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/12/cancel"))
            .and(header_regex("idempotency-key", "^chat:order_cancel:[0-9a-f]{16}$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"order": {"status": "CANCELED"}})))
            .expect(1)
            .mount(&commerce)
            .await;

        let router = router(&commerce.uri(), "http://127.0.0.1:9", ToolsConfig::default());
        let (state, pending) = started(&router).await;

        let turn = Turn::new(&format!("확인 {}", pending.confirm_token), Some("1"), state);
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::OK);
        assert!(outcome.tool_succeeded);
        assert_eq!(outcome.patch.pending_action, FieldPatch::Clear);
        assert_eq!(outcome.reply.citations, vec!["COMMERCE / orders/12/cancel"]);
        let last = outcome.audits.last().unwrap();
        assert_eq!(last.decision, AuditDecision::Allow);
        assert_eq!(last.result, AuditResult::Success);
    }

    #[tokio::test]
    async fn test_wrong_token_never_mutates() {
        let commerce = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&commerce)
            .await;

        let router = router(&commerce.uri(), "http://127.0.0.1:9", ToolsConfig::default());
        let (state, pending) = started(&router).await;
        assert_ne!(pending.confirm_token, "aaaaaa");

        let turn = Turn::new("확인 AAAAAA", Some("1"), state);
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::CONFIRMATION_REQUIRED);
        assert!(outcome.patch.pending_action.is_keep());
        assert_eq!(outcome.audits[0].decision, AuditDecision::Deny);
    }

    #[tokio::test]
    async fn test_abort_and_expiry_clear() {
        let router = router("http://127.0.0.1:9", "http://127.0.0.1:9", ToolsConfig::default());
        let (state, pending) = started(&router).await;

        let turn = Turn::new("그만 할게요", Some("1"), state.clone());
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::USER_ABORTED);
        assert_eq!(outcome.patch.pending_action, FieldPatch::Clear);

        let mut expired = state;
        if let Some(p) = expired.pending_action.as_mut() {
            p.expires_at = Utc::now() - Duration::seconds(1);
        }
        let turn = Turn::new(&format!("확인 {}", pending.confirm_token), Some("1"), expired);
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::CONFIRMATION_EXPIRED);
        assert_eq!(outcome.patch.pending_action, FieldPatch::Clear);
    }

    #[tokio::test]
    async fn test_server_error_keeps_action_for_retry() {
        let commerce = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/12/cancel"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&commerce)
            .await;

        let tools = ToolsConfig {
            max_retry: 1,
            ..Default::default()
        };
        let router = router(&commerce.uri(), "http://127.0.0.1:9", tools);
        let (mut state, pending) = started(&router).await;
        let confirm = format!("확인 {}", pending.confirm_token);

        let turn = Turn::new(&confirm, Some("1"), state.clone());
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::TOOL_RETRYABLE_FAILURE);
        let FieldPatch::Set(retry) = outcome.patch.pending_action.clone() else {
            panic!("pending action dropped on a retryable failure");
        };
        assert_eq!(retry.state, PendingState::FailedRetryable);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.idempotency_key, pending.idempotency_key);
        outcome.patch.apply(&mut state, Utc::now());

        let turn = Turn::new(&confirm, Some("1"), state);
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.next_action, Some(NextAction::OpenSupportTicket));
        assert_eq!(outcome.patch.pending_action, FieldPatch::Clear);
    }

    #[tokio::test]
    async fn test_only_the_starting_user_can_confirm() {
        let commerce = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"order": {"status": "CANCELED"}})))
            .expect(0)
            .mount(&commerce)
            .await;

        let router = router(&commerce.uri(), "http://127.0.0.1:9", ToolsConfig::default());
        let (state, pending) = started(&router).await;
        assert_eq!(pending.actor_user_id.as_deref(), Some("1"));
        let confirm = format!("확인 {}", pending.confirm_token);

        let anonymous = Turn::new(&confirm, None, state.clone());
        let outcome = router.route(&anonymous.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::AUTH_REQUIRED);
        assert!(outcome.patch.pending_action.is_keep());
        assert_eq!(outcome.audits[0].decision, AuditDecision::Deny);

        let other = Turn::new(&confirm, Some("2"), state.clone());
        let outcome = router.route(&other.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::AUTH_FORBIDDEN);
        assert!(outcome.patch.pending_action.is_keep());

        let abort = Turn::new("그만 할게요", Some("2"), state);
        let outcome = router.route(&abort.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::AUTH_FORBIDDEN);
        assert!(outcome.patch.pending_action.is_keep());
    }

    #[tokio::test]
    async fn test_execute_refuses_unconfirmed() {
        let router = router("http://127.0.0.1:9", "http://127.0.0.1:9", ToolsConfig::default());
        let (state, pending) = started(&router).await;
        let turn = Turn::new("확인", Some("1"), state);
        let outcome = execute(&router, &turn.ctx(), pending).await;
        assert_eq!(outcome.reply.reason_code, reason::DENY_EXECUTE_NOT_CONFIRMED);
        assert_eq!(outcome.audits[0].decision, AuditDecision::Deny);
    }
}

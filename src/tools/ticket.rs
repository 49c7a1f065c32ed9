//! Support ticket create, status and list.

use serde_json::Value;

use shelf_core::models::{
    AuditDecision, AuditResult, FieldPatch, LastTicket, Reply, SessionPatch, Source,
    SLOT_TICKET_NO,
};
use shelf_core::normalize::normalize_query;
use shelf_core::reason;

use crate::commerce::{field_str, unwrap_envelope, unwrap_list};
use crate::guardrails::ticket_fingerprint;

use super::{failure_reply, ToolContext, ToolFailure, ToolOutcome, ToolRouter};

const TRIGGER_WORDS: &[&str] = &[
    "문의", "티켓", "상담", "접수", "등록", "남겨", "해줘", "해 줘", "해주세요", "주세요", "줘",
    "ticket", "support", "create", "open", "file", "please",
];
const MIN_ISSUE_CHARS: usize = 2;
const LIST_LIMIT: usize = 5;

fn strip_triggers(token: &str) -> String {
    let mut rest = token.to_string();
    for word in TRIGGER_WORDS {
        rest = rest.replace(word, "");
    }
    rest.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// The issue text left once ticket trigger words are removed.
pub fn issue_from_message(message: &str) -> Option<String> {
    let normalized = normalize_query(message);
    let kept: Vec<&str> = normalized
        .split_whitespace()
        .filter(|token| !strip_triggers(token).is_empty())
        .collect();
    let issue = kept.join(" ");
    (issue.chars().count() >= MIN_ISSUE_CHARS).then_some(issue)
}

fn is_substantive(text: &str) -> bool {
    let normalized = normalize_query(text);
    normalized.chars().count() >= 4 && !TRIGGER_WORDS[..3].iter().any(|w| normalized.contains(w))
}

fn ticket_source(ticket_no: &str, snippet: String) -> Source {
    Source::new(format!("COMMERCE / support/tickets/{}", ticket_no), "문의 내역").with_snippet(snippet)
}

fn parse_ticket(body: &Value, owner: Option<&str>, now: chrono::DateTime<chrono::Utc>) -> Option<LastTicket> {
    let ticket = unwrap_envelope(body, "ticket");
    Some(LastTicket {
        ticket_no: field_str(ticket, "ticket_no")?,
        ticket_id: field_str(ticket, "ticket_id").or_else(|| field_str(ticket, "id")),
        owner_user_id: owner.map(str::to_string),
        created_at: now,
    })
}

pub async fn create(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    let Some(user_id) = ctx.user_id else {
        return ToolOutcome::reply(Reply::new(reason::AUTH_REQUIRED, "로그인 후 문의를 접수할 수 있습니다."));
    };

    let mut from_unresolved = false;
    let issue = issue_from_message(ctx.message)
        .or_else(|| {
            let preview = ctx
                .session
                .unresolved_context
                .as_ref()
                .map(|u| u.query_preview.clone())
                .filter(|p| !p.trim().is_empty());
            from_unresolved = preview.is_some();
            preview
        })
        .or_else(|| {
            ctx.history
                .iter()
                .rev()
                .filter(|m| m.role == "user")
                .find(|m| is_substantive(&m.content))
                .map(|m| normalize_query(&m.content))
        });
    let Some(issue) = issue else {
        return ToolOutcome::reply(Reply::new(
            reason::MISSING_INPUT,
            "어떤 내용으로 문의를 남길지 알려 주세요.",
        ));
    };

    if let Some(existing) = router.guardrails.ticket_dedup(user_id, &issue).await {
        router.metrics.inc("chat_ticket_dedup_total", &[]);
        let content = format!(
            "같은 내용으로 접수된 문의 {}를 재사용합니다. 담당자가 확인 후 안내드리겠습니다.",
            existing.ticket_no
        );
        let source = ticket_source(&existing.ticket_no, issue.clone());
        return ToolOutcome::succeeded(Reply::ok(content).with_sources(vec![source])).with_patch(
            SessionPatch {
                last_ticket: FieldPatch::Set(existing),
                ..Default::default()
            },
        );
    }

    if let Err(retry_after_ms) = router.guardrails.claim_ticket_slot(user_id).await {
        return ToolOutcome::reply(
            Reply::new(
                reason::RATE_LIMITED,
                "방금 문의를 접수하셨습니다. 잠시 후 다시 시도해 주세요.",
            )
            .with_retry_after(retry_after_ms),
        );
    }

    let fingerprint = ticket_fingerprint(user_id, &issue);
    let idempotency_key = format!("chat:ticket_create:{}", &fingerprint[..16]);
    let call = ctx.call_context();
    let result = router
        .call(
            "ticket_create",
            router.commerce.create_ticket(&issue, &call, &idempotency_key),
        )
        .await;
    let body = match result {
        Ok(body) => body,
        Err(failure) => {
            router.guardrails.release_ticket_slot(user_id).await;
            return router.failure_outcome(ctx, "ticket_create", &failure);
        }
    };
    let Some(ticket) = parse_ticket(&body, Some(user_id), ctx.now) else {
        router.guardrails.release_ticket_slot(user_id).await;
        tracing::warn!(trace_id = ctx.trace_id, "ticket create response has no ticket_no");
        return ToolOutcome::reply(failure_reply(&ToolFailure::Commerce(
            crate::commerce::CommerceError::Decode("missing ticket_no".into()),
        )));
    };

    router.guardrails.remember_ticket_issue(user_id, &issue, &ticket).await;
    router.guardrails.remember_user_ticket(user_id, &ticket).await;
    router.guardrails.start_ticket_cooldown(user_id).await;
    tracing::info!(ticket_no = %ticket.ticket_no, trace_id = ctx.trace_id, "support ticket created");

    let mut audit = ctx.audit(
        "TICKET_CREATE",
        "SUCCESS",
        AuditDecision::Allow,
        AuditResult::Success,
        reason::OK,
    );
    audit.target_ref = Some(ticket.ticket_no.clone());
    audit.idempotency_key = Some(idempotency_key);

    let content = format!(
        "문의가 접수되었습니다. 접수번호는 {}입니다. 담당자가 확인 후 안내드리겠습니다.",
        ticket.ticket_no
    );
    let source = ticket_source(&ticket.ticket_no, issue);
    ToolOutcome::succeeded(Reply::ok(content).with_sources(vec![source]))
        .with_patch(SessionPatch {
            last_ticket: FieldPatch::Set(ticket),
            unresolved_context: if from_unresolved {
                FieldPatch::Clear
            } else {
                FieldPatch::Keep
            },
            ..Default::default()
        })
        .with_audit(audit)
}

fn describe_ticket(ticket: &Value, events: Option<&Value>) -> String {
    let number = field_str(ticket, "ticket_no").unwrap_or_default();
    let status = field_str(ticket, "status").unwrap_or_else(|| "확인 중".to_string());
    let mut text = format!("문의 {}의 상태는 '{}'입니다.", number, status);
    if let Some(summary) = field_str(ticket, "summary") {
        text.push_str(&format!(" 내용: {}.", summary));
    }
    let latest = events
        .map(|e| unwrap_list(e, "events"))
        .and_then(|events| events.last().copied())
        .and_then(|e| field_str(e, "note").or_else(|| field_str(e, "event_type")));
    if let Some(latest) = latest {
        text.push_str(&format!(" 최근 처리 내역: {}.", latest));
    }
    text
}

/// Ticket number to look up: explicit, the session's own last ticket, or
/// the user's last ticket.
async fn resolve_ticket_no(router: &ToolRouter, ctx: &ToolContext<'_>, user_id: &str) -> Option<String> {
    if let Some(no) = ctx.understanding.slot(SLOT_TICKET_NO) {
        return Some(no.to_string());
    }
    if let Some(last) = &ctx.session.last_ticket {
        if last.owner_user_id.as_deref() == Some(user_id) {
            return Some(last.ticket_no.clone());
        }
        router.metrics.inc("chat_ticket_owner_mismatch_total", &[]);
        tracing::warn!(
            conversation_id = ctx.conversation_id,
            trace_id = ctx.trace_id,
            "cached session ticket belongs to another user; ignoring"
        );
    }
    router
        .guardrails
        .user_last_ticket(user_id)
        .await
        .map(|t| t.ticket_no)
}

fn no_tickets() -> ToolOutcome {
    ToolOutcome::reply(Reply::ok("접수된 문의 내역이 없습니다."))
}

pub async fn status(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    let Some(user_id) = ctx.user_id else {
        return ToolOutcome::reply(Reply::new(reason::AUTH_REQUIRED, "로그인 후 문의 내역을 확인할 수 있습니다."));
    };
    let call = ctx.call_context();

    let ticket = match resolve_ticket_no(router, ctx, user_id).await {
        Some(no) => {
            match router
                .call("ticket_status", router.commerce.ticket_by_number(&no, &call))
                .await
            {
                Ok(body) => unwrap_envelope(&body, "ticket").clone(),
                Err(failure) => return router.failure_outcome(ctx, "ticket_status", &failure),
            }
        }
        None => match router
            .call("ticket_list", router.commerce.list_tickets(1, &call))
            .await
        {
            Ok(body) => match unwrap_list(&body, "tickets").first() {
                Some(t) => (*t).clone(),
                None => return no_tickets(),
            },
            Err(failure) => return router.failure_outcome(ctx, "ticket_list", &failure),
        },
    };

    let Some(ticket_no) = field_str(&ticket, "ticket_no") else {
        return no_tickets();
    };
    let events = match field_str(&ticket, "ticket_id").or_else(|| field_str(&ticket, "id")) {
        Some(id) => router
            .call("ticket_events", router.commerce.ticket_events(&id, &call))
            .await
            .ok(),
        None => None,
    };
    let content = describe_ticket(&ticket, events.as_ref());
    let snippet = field_str(&ticket, "status").unwrap_or_default();
    ToolOutcome::succeeded(Reply::ok(content).with_sources(vec![ticket_source(&ticket_no, snippet)]))
}

pub async fn list(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    let call = ctx.call_context();
    let body = match router
        .call("ticket_list", router.commerce.list_tickets(LIST_LIMIT, &call))
        .await
    {
        Ok(body) => body,
        Err(failure) => return router.failure_outcome(ctx, "ticket_list", &failure),
    };
    let tickets = unwrap_list(&body, "tickets");
    if tickets.is_empty() {
        return no_tickets();
    }
    let mut lines = vec![format!("최근 문의 {}건입니다.", tickets.len())];
    let mut sources = Vec::new();
    for (i, ticket) in tickets.iter().enumerate() {
        let no = field_str(ticket, "ticket_no").unwrap_or_default();
        let status = field_str(ticket, "status").unwrap_or_default();
        lines.push(format!("{}. {} ({})", i + 1, no, status));
        if !no.is_empty() {
            sources.push(ticket_source(&no, status));
        }
    }
    ToolOutcome::succeeded(Reply::ok(lines.join("\n")).with_sources(sources))
}

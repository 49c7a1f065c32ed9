//! Core data models used throughout Shelf.
//!
//! These types represent the conversation session, the per-turn
//! understanding and policy decision, the append-only turn/audit records,
//! and the chat request/response wire shapes. Loose JSON coming from
//! upstreams (`args`, `payload`, `metadata`) is kept as
//! [`serde_json::Value`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reason::{recovery_hint, ChatStatus, NextAction};

pub const SLOT_ORDER_REF: &str = "order_ref";
pub const SLOT_TICKET_NO: &str = "ticket_no";
pub const SLOT_ISBN: &str = "isbn";
pub const SLOT_SELECTION_INDEX: &str = "selection_index";
pub const SLOT_CONFIRM_TOKEN: &str = "confirm_token";

// ============ Understanding ============

/// Rule-based intent of a user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    OrderLookup,
    ShipmentLookup,
    RefundLookup,
    OrderCancel,
    RefundCreate,
    TicketCreate,
    TicketStatus,
    TicketList,
    BookRecommend,
    CartRecommend,
    RefundPolicy,
    ShippingPolicy,
    OrderPolicy,
    /// Clearly commerce, but not confident enough to act on.
    Unknown,
    #[serde(rename = "NONE")]
    NoIntent,
}

/// Coarse grouping the policy engine routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentClass {
    WriteSensitive,
    Read,
    Answer,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::OrderLookup => "ORDER_LOOKUP",
            Intent::ShipmentLookup => "SHIPMENT_LOOKUP",
            Intent::RefundLookup => "REFUND_LOOKUP",
            Intent::OrderCancel => "ORDER_CANCEL",
            Intent::RefundCreate => "REFUND_CREATE",
            Intent::TicketCreate => "TICKET_CREATE",
            Intent::TicketStatus => "TICKET_STATUS",
            Intent::TicketList => "TICKET_LIST",
            Intent::BookRecommend => "BOOK_RECOMMEND",
            Intent::CartRecommend => "CART_RECOMMEND",
            Intent::RefundPolicy => "REFUND_POLICY",
            Intent::ShippingPolicy => "SHIPPING_POLICY",
            Intent::OrderPolicy => "ORDER_POLICY",
            Intent::Unknown => "UNKNOWN",
            Intent::NoIntent => "NONE",
        }
    }

    pub fn class(&self) -> IntentClass {
        match self {
            Intent::OrderCancel | Intent::RefundCreate => IntentClass::WriteSensitive,
            Intent::OrderLookup
            | Intent::ShipmentLookup
            | Intent::RefundLookup
            | Intent::TicketCreate
            | Intent::TicketStatus
            | Intent::TicketList
            | Intent::CartRecommend => IntentClass::Read,
            Intent::RefundPolicy
            | Intent::ShippingPolicy
            | Intent::OrderPolicy
            | Intent::BookRecommend
            | Intent::NoIntent => IntentClass::Answer,
            Intent::Unknown => IntentClass::Unknown,
        }
    }

    pub fn risk_level(&self) -> RiskLevel {
        match self.class() {
            IntentClass::WriteSensitive => RiskLevel::WriteSensitive,
            IntentClass::Read => RiskLevel::Read,
            _ => RiskLevel::Low,
        }
    }

    /// Lookups and writes scoped to a single order.
    pub fn requires_order_ref(&self) -> bool {
        matches!(
            self,
            Intent::OrderLookup
                | Intent::ShipmentLookup
                | Intent::RefundLookup
                | Intent::OrderCancel
                | Intent::RefundCreate
        )
    }

    pub fn action_type(&self) -> Option<ActionType> {
        match self {
            Intent::OrderCancel => Some(ActionType::OrderCancel),
            Intent::RefundCreate => Some(ActionType::RefundCreate),
            _ => None,
        }
    }

    /// Cache alias of the composed answer for a policy topic.
    pub fn policy_topic_alias(&self) -> Option<&'static str> {
        match self {
            Intent::RefundPolicy => Some("commerce-refund-guide"),
            Intent::ShippingPolicy => Some("commerce-shipping-guide"),
            Intent::OrderPolicy => Some("commerce-order-guide"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Read,
    WriteSensitive,
}

/// Ephemeral per-turn understanding of the user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUnderstanding {
    pub intent: Intent,
    pub slots: BTreeMap<String, String>,
    pub standalone_query: String,
    pub risk_level: RiskLevel,
    /// First 16 hex chars of SHA-256 over the normalized standalone query.
    pub q_key: String,
    pub confidence: f64,
    /// The message points at an item of a previously shown list.
    #[serde(default)]
    pub is_reference: bool,
}

impl ToolUnderstanding {
    pub fn slot(&self, name: &str) -> Option<&str> {
        self.slots.get(name).map(String::as_str)
    }
}

// ============ Policy ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    Ask,
    Options,
    Confirm,
    Execute,
    Answer,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Ask => "ASK",
            Route::Options => "OPTIONS",
            Route::Confirm => "CONFIRM",
            Route::Execute => "EXECUTE",
            Route::Answer => "ANSWER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub route: Route,
    pub reason_code: String,
    pub policy_rule_id: String,
    pub missing_slots: Vec<String>,
}

// ============ Session ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    OrderCancel,
    RefundCreate,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::OrderCancel => "order_cancel",
            ActionType::RefundCreate => "refund_create",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ActionType::OrderCancel => "주문 취소",
            ActionType::RefundCreate => "환불 신청",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingState {
    AwaitingConfirmation,
    Confirmed,
    FailedRetryable,
}

impl PendingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingState::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            PendingState::Confirmed => "CONFIRMED",
            PendingState::FailedRetryable => "FAILED_RETRYABLE",
        }
    }
}

/// A sensitive write awaiting user confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub action_type: ActionType,
    pub state: PendingState,
    pub idempotency_key: String,
    pub confirm_token: String,
    /// User who started the action; only they may confirm or abort it.
    #[serde(default)]
    pub actor_user_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl PendingAction {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn order_ref(&self) -> Option<&str> {
        self.args.get("order_ref").and_then(Value::as_str)
    }

    pub fn is_actor(&self, user_id: Option<&str>) -> bool {
        matches!((self.actor_user_id.as_deref(), user_id), (Some(actor), Some(user)) if actor == user)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedContext {
    pub reason_code: String,
    pub query_preview: String,
    pub next_action: NextAction,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCandidate {
    pub doc_id: String,
    pub title: String,
    #[serde(default)]
    pub citation_key: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
}

/// Last disambiguation / recommendation set shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSnapshot {
    pub kind: String,
    pub candidates: Vec<SelectionCandidate>,
    #[serde(default)]
    pub selected_index: Option<usize>,
    #[serde(default)]
    pub selected_entity: Option<SelectionCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastTicket {
    pub ticket_no: String,
    #[serde(default)]
    pub ticket_id: Option<String>,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable record of conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub tenant_id: String,
    pub state_version: i64,
    #[serde(default)]
    pub last_turn_id: Option<String>,
    #[serde(default)]
    pub last_trace_id: Option<String>,
    #[serde(default)]
    pub last_request_id: Option<String>,
    #[serde(default)]
    pub fallback_count: u32,
    #[serde(default)]
    pub unresolved_context: Option<UnresolvedContext>,
    #[serde(default)]
    pub pending_action: Option<PendingAction>,
    #[serde(default)]
    pub selection: Option<SelectionSnapshot>,
    #[serde(default)]
    pub last_ticket: Option<LastTicket>,
    #[serde(default)]
    pub summary_short: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    /// A fresh, never-persisted session.
    pub fn new(conversation_id: &str, tenant_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: None,
            tenant_id: tenant_id.to_string(),
            state_version: 0,
            last_turn_id: None,
            last_trace_id: None,
            last_request_id: None,
            fallback_count: 0,
            unresolved_context: None,
            pending_action: None,
            selection: None,
            last_ticket: None,
            summary_short: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Tri-state update for an optional session field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for FieldPatch<T> {
    fn default() -> Self {
        FieldPatch::Keep
    }
}

impl<T> FieldPatch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, FieldPatch::Keep)
    }

    pub fn apply_to(self, slot: &mut Option<T>) {
        match self {
            FieldPatch::Keep => {}
            FieldPatch::Set(value) => *slot = Some(value),
            FieldPatch::Clear => *slot = None,
        }
    }

    /// `other` wins unless it is `Keep`.
    pub fn merge(self, other: FieldPatch<T>) -> FieldPatch<T> {
        if other.is_keep() {
            self
        } else {
            other
        }
    }
}

/// Partial session update; fields left as `None`/`Keep` are preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub user_id: Option<String>,
    pub last_turn_id: Option<String>,
    pub last_trace_id: Option<String>,
    pub last_request_id: Option<String>,
    pub fallback_count: Option<u32>,
    pub unresolved_context: FieldPatch<UnresolvedContext>,
    pub pending_action: FieldPatch<PendingAction>,
    pub selection: FieldPatch<SelectionSnapshot>,
    pub last_ticket: FieldPatch<LastTicket>,
    pub summary_short: FieldPatch<String>,
    pub expires_at: FieldPatch<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn apply(self, state: &mut SessionState, now: DateTime<Utc>) {
        if let Some(user_id) = self.user_id {
            state.user_id = Some(user_id);
        }
        if let Some(turn) = self.last_turn_id {
            state.last_turn_id = Some(turn);
        }
        if let Some(trace) = self.last_trace_id {
            state.last_trace_id = Some(trace);
        }
        if let Some(request) = self.last_request_id {
            state.last_request_id = Some(request);
        }
        if let Some(count) = self.fallback_count {
            state.fallback_count = count;
        }
        self.unresolved_context
            .apply_to(&mut state.unresolved_context);
        self.pending_action.apply_to(&mut state.pending_action);
        self.selection.apply_to(&mut state.selection);
        self.last_ticket.apply_to(&mut state.last_ticket);
        self.summary_short.apply_to(&mut state.summary_short);
        self.expires_at.apply_to(&mut state.expires_at);
        state.updated_at = now;
    }

    /// Combine two patches; fields set in `other` override `self`.
    pub fn merge(self, other: SessionPatch) -> SessionPatch {
        SessionPatch {
            user_id: other.user_id.or(self.user_id),
            last_turn_id: other.last_turn_id.or(self.last_turn_id),
            last_trace_id: other.last_trace_id.or(self.last_trace_id),
            last_request_id: other.last_request_id.or(self.last_request_id),
            fallback_count: other.fallback_count.or(self.fallback_count),
            unresolved_context: self.unresolved_context.merge(other.unresolved_context),
            pending_action: self.pending_action.merge(other.pending_action),
            selection: self.selection.merge(other.selection),
            last_ticket: self.last_ticket.merge(other.last_ticket),
            summary_short: self.summary_short.merge(other.summary_short),
            expires_at: self.expires_at.merge(other.expires_at),
        }
    }
}

// ============ Append-only records ============

pub const EVENT_USER_MESSAGE: &str = "USER_MESSAGE";
pub const EVENT_POLICY_DECISION: &str = "POLICY_DECISION";
pub const EVENT_ASSISTANT_RESPONSE: &str = "ASSISTANT_RESPONSE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnEvent {
    pub conversation_id: String,
    pub turn_id: String,
    pub event_type: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDecision {
    Allow,
    Deny,
    Blocked,
}

impl AuditDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditDecision::Allow => "ALLOW",
            AuditDecision::Deny => "DENY",
            AuditDecision::Blocked => "BLOCKED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    Success,
    Fail,
    Pending,
    Recorded,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "SUCCESS",
            AuditResult::Fail => "FAIL",
            AuditResult::Pending => "PENDING",
            AuditResult::Recorded => "RECORDED",
        }
    }
}

pub const AUDIT_RETENTION_PURGE: &str = "RETENTION_PURGE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAudit {
    pub conversation_id: String,
    pub action_type: String,
    pub action_state: String,
    pub decision: AuditDecision,
    pub result: AuditResult,
    #[serde(default)]
    pub actor_user_id: Option<String>,
    #[serde(default)]
    pub actor_admin_id: Option<String>,
    #[serde(default)]
    pub target_ref: Option<String>,
    #[serde(default)]
    pub auth_context: Value,
    pub reason_code: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub event_time: DateTime<Utc>,
}

impl ActionAudit {
    pub fn new(
        conversation_id: &str,
        action_type: &str,
        action_state: &str,
        decision: AuditDecision,
        result: AuditResult,
        reason_code: &str,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            action_type: action_type.to_string(),
            action_state: action_state.to_string(),
            decision,
            result,
            actor_user_id: None,
            actor_admin_id: None,
            target_ref: None,
            auth_context: Value::Null,
            reason_code: reason_code.to_string(),
            idempotency_key: None,
            metadata: Value::Null,
            trace_id: None,
            request_id: None,
            event_time: Utc::now(),
        }
    }
}

// ============ Chat wire shapes ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub admin_id: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub rerank: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: ChatMessage,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default)]
    pub options: ChatOptions,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            message: ChatMessage::user(message),
            history: Vec::new(),
            client: ClientInfo::default(),
            options: ChatOptions::default(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.client.user_id = Some(user_id.into());
        self
    }
}

/// An evidence source attached to a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub citation_key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
}

impl Source {
    pub fn new(citation_key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            citation_key: citation_key.into(),
            title: title.into(),
            url: None,
            snippet: None,
            doc_id: None,
            chunk_id: None,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskBand {
    R1,
    R2,
    R3,
}

impl RiskBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::R1 => "R1",
            RiskBand::R2 => "R2",
            RiskBand::R3 => "R3",
        }
    }
}

/// Handler-level answer before it is wrapped in the response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub reason_code: String,
    pub content: String,
    pub sources: Vec<Source>,
    pub citations: Vec<String>,
    pub retry_after_ms: Option<u64>,
    pub next_action: Option<NextAction>,
}

impl Reply {
    pub fn new(reason_code: &str, content: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.to_string(),
            content: content.into(),
            sources: Vec::new(),
            citations: Vec::new(),
            retry_after_ms: None,
            next_action: None,
        }
    }

    pub fn ok(content: impl Into<String>) -> Self {
        Self::new(crate::reason::OK, content)
    }

    /// Attach sources; citations become their keys in order.
    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.citations = sources.iter().map(|s| s.citation_key.clone()).collect();
        self.sources = sources;
        self
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn with_next_action(mut self, next_action: NextAction) -> Self {
        self.next_action = Some(next_action);
        self
    }

    pub fn status(&self) -> ChatStatus {
        recovery_hint(&self.reason_code).status
    }
}

pub const RESPONSE_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub version: String,
    pub trace_id: String,
    pub request_id: String,
    pub session_id: String,
    pub status: ChatStatus,
    pub reason_code: String,
    pub recoverable: bool,
    pub next_action: NextAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub answer: ChatMessage,
    pub sources: Vec<Source>,
    pub citations: Vec<String>,
    pub risk_band: RiskBand,
}

impl ChatResponse {
    pub fn from_reply(
        reply: Reply,
        trace_id: &str,
        request_id: &str,
        session_id: &str,
        risk_band: RiskBand,
    ) -> Self {
        let hint = recovery_hint(&reply.reason_code);
        Self {
            version: RESPONSE_VERSION.to_string(),
            trace_id: trace_id.to_string(),
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            status: hint.status,
            reason_code: reply.reason_code,
            recoverable: hint.recoverable,
            next_action: reply.next_action.unwrap_or(hint.next_action),
            retry_after_ms: reply.retry_after_ms,
            answer: ChatMessage::assistant(reply.content),
            sources: reply.sources,
            citations: reply.citations,
            risk_band,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_classes_follow_risk() {
        assert_eq!(Intent::OrderCancel.risk_level(), RiskLevel::WriteSensitive);
        assert_eq!(Intent::TicketList.risk_level(), RiskLevel::Read);
        assert_eq!(Intent::RefundPolicy.risk_level(), RiskLevel::Low);
        assert_eq!(Intent::Unknown.class(), IntentClass::Unknown);
    }

    #[test]
    fn no_intent_serializes_as_none() {
        assert_eq!(serde_json::to_string(&Intent::NoIntent).unwrap(), "\"NONE\"");
        assert_eq!(Intent::NoIntent.as_str(), "NONE");
    }

    #[test]
    fn patch_preserves_unsupplied_fields() {
        let now = Utc::now();
        let mut state = SessionState::new("c1", "t1", now);
        state.user_id = Some("u1".into());
        state.summary_short = Some("summary".into());

        let patch = SessionPatch {
            fallback_count: Some(2),
            ..Default::default()
        };
        patch.apply(&mut state, now);

        assert_eq!(state.user_id.as_deref(), Some("u1"));
        assert_eq!(state.summary_short.as_deref(), Some("summary"));
        assert_eq!(state.fallback_count, 2);
    }

    #[test]
    fn patch_clear_removes_field() {
        let now = Utc::now();
        let mut state = SessionState::new("c1", "t1", now);
        state.summary_short = Some("summary".into());
        let patch = SessionPatch {
            summary_short: FieldPatch::Clear,
            ..Default::default()
        };
        patch.apply(&mut state, now);
        assert!(state.summary_short.is_none());
    }

    #[test]
    fn merge_prefers_later_values() {
        let a = SessionPatch {
            fallback_count: Some(1),
            summary_short: FieldPatch::Set("a".into()),
            ..Default::default()
        };
        let b = SessionPatch {
            fallback_count: Some(0),
            ..Default::default()
        };
        let merged = a.merge(b);
        assert_eq!(merged.fallback_count, Some(0));
        assert_eq!(merged.summary_short, FieldPatch::Set("a".into()));
    }

    #[test]
    fn response_from_reply_uses_hint() {
        let reply = Reply::new(crate::reason::AUTH_REQUIRED, "로그인이 필요합니다.");
        let resp = ChatResponse::from_reply(reply, "tr", "rq", "s1", RiskBand::R1);
        assert_eq!(resp.status, ChatStatus::NeedsAuth);
        assert_eq!(resp.next_action, NextAction::LoginRequired);
        assert_eq!(resp.version, "v1");
    }

    #[test]
    fn reply_citations_follow_sources() {
        let reply = Reply::ok("done").with_sources(vec![
            Source::new("A", "a"),
            Source::new("B", "b"),
        ]);
        assert_eq!(reply.citations, vec!["A".to_string(), "B".to_string()]);
    }
}

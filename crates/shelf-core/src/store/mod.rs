//! Durable conversation storage.
//!
//! The [`SessionStore`] trait covers session state, the append-only turn
//! event and action audit logs, and retention. The service crate provides
//! a SQLite implementation; [`memory::InMemorySessionStore`] is used in
//! tests and when durable sessions are disabled.
//!
//! Implementations must:
//!
//! - increment `state_version` by exactly one per `upsert`,
//! - preserve fields a [`SessionPatch`] leaves as `Keep`,
//! - pass PII-bearing fields through the [`Redactor`](crate::redact::Redactor)
//!   before storing them,
//! - treat a duplicate `(conversation_id, turn_id, event_type)` append as
//!   a no-op returning `false`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    ActionAudit, AuditDecision, AuditResult, FieldPatch, SessionPatch, SessionState, TurnEvent,
    AUDIT_RETENTION_PURGE,
};
use crate::reason::OK;

/// Conversation id used for audit rows not tied to a conversation.
pub const SYSTEM_CONVERSATION: &str = "__system__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionOptions {
    pub session_days: i64,
    pub turn_event_days: i64,
    pub action_audit_days: i64,
    pub batch_size: usize,
    pub max_batches: usize,
    pub dry_run: bool,
    pub now: DateTime<Utc>,
}

impl RetentionOptions {
    pub fn session_cutoff(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.session_days)
    }

    pub fn turn_event_cutoff(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.turn_event_days)
    }

    pub fn action_audit_cutoff(&self) -> DateTime<Utc> {
        self.now - Duration::days(self.action_audit_days)
    }

    /// Most rows one table may lose in a single pass.
    pub fn row_cap(&self) -> usize {
        self.batch_size.saturating_mul(self.max_batches)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub sessions: u64,
    pub turn_events: u64,
    pub action_audits: u64,
}

/// Patch that clears everything a stuck conversation could be waiting on.
pub fn reset_patch() -> SessionPatch {
    SessionPatch {
        fallback_count: Some(0),
        unresolved_context: FieldPatch::Clear,
        pending_action: FieldPatch::Clear,
        selection: FieldPatch::Clear,
        ..Default::default()
    }
}

/// The `RETENTION_PURGE` audit row appended after every retention pass.
pub fn retention_audit(report: &RetentionReport, now: DateTime<Utc>) -> ActionAudit {
    let (state, result) = if report.dry_run {
        ("DRY_RUN", AuditResult::Recorded)
    } else {
        ("PURGED", AuditResult::Success)
    };
    let mut audit = ActionAudit::new(
        SYSTEM_CONVERSATION,
        AUDIT_RETENTION_PURGE,
        state,
        AuditDecision::Allow,
        result,
        OK,
    );
    audit.metadata = serde_json::json!({
        "sessions": report.sessions,
        "turn_events": report.turn_events,
        "action_audits": report.action_audits,
        "dry_run": report.dry_run,
    });
    audit.event_time = now;
    audit
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<SessionState>>;

    /// Read-modify-write under the conversation's lock. Returns the stored
    /// state with its new `state_version`.
    async fn upsert(
        &self,
        conversation_id: &str,
        tenant_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionState>;

    /// Returns `false` when the event already exists.
    async fn append_turn_event(&self, event: TurnEvent) -> Result<bool>;

    async fn append_action_audit(&self, audit: ActionAudit) -> Result<()>;

    async fn list_turn_events(&self, conversation_id: &str) -> Result<Vec<TurnEvent>>;

    async fn list_action_audits(&self, conversation_id: &str) -> Result<Vec<ActionAudit>>;

    async fn run_retention(&self, options: &RetentionOptions) -> Result<RetentionReport>;

    async fn reset(&self, conversation_id: &str, tenant_id: &str) -> Result<SessionState> {
        self.upsert(conversation_id, tenant_id, reset_patch()).await
    }
}

//! In-memory [`SessionStore`] for tests and for running without a durable
//! session store.
//!
//! A single `Mutex` guards all three collections, so every operation is
//! trivially serialized per conversation.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{ActionAudit, SessionPatch, SessionState, TurnEvent, AUDIT_RETENTION_PURGE};
use crate::redact::Redactor;

use super::{retention_audit, RetentionOptions, RetentionReport, SessionStore};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionState>,
    turn_events: Vec<TurnEvent>,
    action_audits: Vec<ActionAudit>,
}

pub struct InMemorySessionStore {
    tables: Mutex<Tables>,
    redactor: Redactor,
}

impl InMemorySessionStore {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            redactor,
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Redactor::new())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<SessionState>> {
        Ok(self.tables().sessions.get(conversation_id).cloned())
    }

    async fn upsert(
        &self,
        conversation_id: &str,
        tenant_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionState> {
        let now = Utc::now();
        let mut tables = self.tables();
        let state = tables
            .sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| SessionState::new(conversation_id, tenant_id, now));
        patch.apply(state, now);
        self.redactor.redact_session(state);
        state.state_version += 1;
        Ok(state.clone())
    }

    async fn append_turn_event(&self, mut event: TurnEvent) -> Result<bool> {
        let mut tables = self.tables();
        let exists = tables.turn_events.iter().any(|e| {
            e.conversation_id == event.conversation_id
                && e.turn_id == event.turn_id
                && e.event_type == event.event_type
        });
        if exists {
            return Ok(false);
        }
        event.payload = self.redactor.redact_json(&event.payload);
        tables.turn_events.push(event);
        Ok(true)
    }

    async fn append_action_audit(&self, mut audit: ActionAudit) -> Result<()> {
        audit.metadata = self.redactor.redact_json(&audit.metadata);
        audit.target_ref = audit.target_ref.map(|t| self.redactor.redact(&t));
        self.tables().action_audits.push(audit);
        Ok(())
    }

    async fn list_turn_events(&self, conversation_id: &str) -> Result<Vec<TurnEvent>> {
        Ok(self
            .tables()
            .turn_events
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn list_action_audits(&self, conversation_id: &str) -> Result<Vec<ActionAudit>> {
        Ok(self
            .tables()
            .action_audits
            .iter()
            .filter(|a| a.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn run_retention(&self, options: &RetentionOptions) -> Result<RetentionReport> {
        let cap = options.row_cap();
        let session_cutoff = options.session_cutoff();
        let event_cutoff = options.turn_event_cutoff();
        let audit_cutoff = options.action_audit_cutoff();

        let mut tables = self.tables();

        let mut expired_sessions: Vec<String> = tables
            .sessions
            .values()
            .filter(|s| {
                s.expires_at.map_or(false, |at| at <= options.now) || s.updated_at < session_cutoff
            })
            .map(|s| s.conversation_id.clone())
            .collect();
        expired_sessions.sort();
        expired_sessions.truncate(cap);

        let mut old_events: Vec<usize> = tables
            .turn_events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.event_time < event_cutoff)
            .map(|(i, _)| i)
            .collect();
        old_events.truncate(cap);

        let mut old_audits: Vec<usize> = tables
            .action_audits
            .iter()
            .enumerate()
            .filter(|(_, a)| a.event_time < audit_cutoff && a.action_type != AUDIT_RETENTION_PURGE)
            .map(|(i, _)| i)
            .collect();
        old_audits.truncate(cap);

        let report = RetentionReport {
            dry_run: options.dry_run,
            sessions: expired_sessions.len() as u64,
            turn_events: old_events.len() as u64,
            action_audits: old_audits.len() as u64,
        };

        if !options.dry_run {
            for id in &expired_sessions {
                tables.sessions.remove(id);
            }
            for idx in old_events.into_iter().rev() {
                tables.turn_events.remove(idx);
            }
            for idx in old_audits.into_iter().rev() {
                tables.action_audits.remove(idx);
            }
        }

        tables
            .action_audits
            .push(retention_audit(&report, options.now));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AuditDecision, AuditResult, FieldPatch, UnresolvedContext, EVENT_USER_MESSAGE,
    };
    use crate::reason::NextAction;
    use crate::store::SYSTEM_CONVERSATION;
    use chrono::Duration;
    use serde_json::json;

    fn event(turn: &str, kind: &str) -> TurnEvent {
        TurnEvent {
            conversation_id: "c1".into(),
            turn_id: turn.into(),
            event_type: kind.into(),
            route: None,
            reason_code: None,
            trace_id: None,
            request_id: None,
            payload: json!({"text": "mail me at a@b.io"}),
            event_time: Utc::now(),
        }
    }

    fn retention(dry_run: bool) -> RetentionOptions {
        RetentionOptions {
            session_days: 30,
            turn_event_days: 30,
            action_audit_days: 90,
            batch_size: 100,
            max_batches: 2,
            dry_run,
            now: Utc::now() + Duration::days(365),
        }
    }

    #[tokio::test]
    async fn test_version_increments_by_one() {
        let store = InMemorySessionStore::default();
        let first = store.upsert("c1", "t", SessionPatch::default()).await.unwrap();
        assert_eq!(first.state_version, 1);
        let second = store
            .upsert(
                "c1",
                "t",
                SessionPatch {
                    user_id: Some("u1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.state_version, first.state_version + 1);
        assert_eq!(second.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_upsert_redacts_preview() {
        let store = InMemorySessionStore::default();
        let patch = SessionPatch {
            unresolved_context: FieldPatch::Set(UnresolvedContext {
                reason_code: "RAG_NO_CHUNKS".into(),
                query_preview: "연락처 010-1234-5678".into(),
                next_action: NextAction::RefineQuery,
                trace_id: None,
                request_id: None,
                updated_at: Utc::now(),
            }),
            ..Default::default()
        };
        let state = store.upsert("c1", "t", patch).await.unwrap();
        let preview = state.unresolved_context.unwrap().query_preview;
        assert_eq!(preview, "연락처 [REDACTED:PHONE]");
    }

    #[tokio::test]
    async fn test_duplicate_event_is_noop() {
        let store = InMemorySessionStore::default();
        assert!(store.append_turn_event(event("t1", EVENT_USER_MESSAGE)).await.unwrap());
        assert!(!store.append_turn_event(event("t1", EVENT_USER_MESSAGE)).await.unwrap());
        let events = store.list_turn_events("c1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["text"], "mail me at [REDACTED:EMAIL]");
    }

    #[tokio::test]
    async fn test_reset_clears_workflow_state() {
        let store = InMemorySessionStore::default();
        store
            .upsert(
                "c1",
                "t",
                SessionPatch {
                    fallback_count: Some(3),
                    summary_short: FieldPatch::Set("keep me".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let state = store.reset("c1", "t").await.unwrap();
        assert_eq!(state.fallback_count, 0);
        assert_eq!(state.summary_short.as_deref(), Some("keep me"));
        assert_eq!(state.state_version, 2);
    }

    #[tokio::test]
    async fn test_retention_dry_run_then_delete() {
        let store = InMemorySessionStore::default();
        store.upsert("c1", "t", SessionPatch::default()).await.unwrap();
        store.append_turn_event(event("t1", EVENT_USER_MESSAGE)).await.unwrap();
        store
            .append_action_audit(ActionAudit::new(
                "c1",
                "order_cancel",
                "AWAITING_CONFIRMATION",
                AuditDecision::Allow,
                AuditResult::Pending,
                "CONFIRMATION_REQUIRED",
            ))
            .await
            .unwrap();

        let dry = store.run_retention(&retention(true)).await.unwrap();
        let dry_again = store.run_retention(&retention(true)).await.unwrap();
        assert_eq!(dry.sessions, 1);
        assert_eq!(dry.turn_events, 1);
        assert_eq!(dry.action_audits, 1);
        assert_eq!(dry, dry_again);
        assert!(store.get("c1").await.unwrap().is_some());

        let real = store.run_retention(&retention(false)).await.unwrap();
        assert_eq!(real.sessions, 1);
        assert!(store.get("c1").await.unwrap().is_none());
        assert!(store.list_action_audits("c1").await.unwrap().is_empty());

        let after = store.run_retention(&retention(false)).await.unwrap();
        assert_eq!(after.sessions + after.turn_events + after.action_audits, 0);

        let purges = store.list_action_audits(SYSTEM_CONVERSATION).await.unwrap();
        assert_eq!(purges.len(), 4);
        assert_eq!(purges[0].result, AuditResult::Recorded);
        assert_eq!(purges[2].result, AuditResult::Success);
    }
}

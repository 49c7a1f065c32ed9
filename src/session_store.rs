//! SQLite-backed [`SessionStore`].
//!
//! Writes to one conversation are serialized by a process-local
//! `tokio::sync::Mutex` per id; the row itself bumps `state_version`
//! with `ON CONFLICT … DO UPDATE`, so two processes sharing the file
//! still never reuse a version.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use shelf_core::models::{
    ActionAudit, AuditDecision, AuditResult, SessionPatch, SessionState, TurnEvent,
    AUDIT_RETENTION_PURGE,
};
use shelf_core::redact::Redactor;
use shelf_core::store::{retention_audit, RetentionOptions, RetentionReport, SessionStore};

use crate::db::{from_millis, to_millis};

pub struct SqliteSessionStore {
    pool: SqlitePool,
    redactor: Redactor,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn encode<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to encode session field")
}

fn decode<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn parse_json(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

fn row_to_state(row: &SqliteRow) -> SessionState {
    SessionState {
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        tenant_id: row.get("tenant_id"),
        state_version: row.get("state_version"),
        last_turn_id: row.get("last_turn_id"),
        last_trace_id: row.get("last_trace_id"),
        last_request_id: row.get("last_request_id"),
        fallback_count: row.get::<i64, _>("fallback_count").max(0) as u32,
        unresolved_context: decode(row.get("unresolved_context_json")),
        pending_action: decode(row.get("pending_action_json")),
        selection: decode(row.get("selection_json")),
        last_ticket: decode(row.get("last_ticket_json")),
        summary_short: row.get("summary_short"),
        expires_at: row.get::<Option<i64>, _>("expires_at").map(from_millis),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn parse_decision(raw: &str) -> AuditDecision {
    match raw {
        "DENY" => AuditDecision::Deny,
        "BLOCKED" => AuditDecision::Blocked,
        _ => AuditDecision::Allow,
    }
}

fn parse_result(raw: &str) -> AuditResult {
    match raw {
        "FAIL" => AuditResult::Fail,
        "PENDING" => AuditResult::Pending,
        "RECORDED" => AuditResult::Recorded,
        _ => AuditResult::Success,
    }
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool, redactor: Redactor) -> Self {
        Self {
            pool,
            redactor,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Drop locks nobody is holding so the map stays bounded.
        if locks.len() > 4096 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Count rows matching `filter`, capped at `cap`.
    async fn count_capped(&self, table: &str, filter: &str, cutoff: i64, cap: usize) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} LIMIT ?)",
            table, filter
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(cutoff)
            .bind(cap as i64)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count expired rows in {}", table))?;
        Ok(count.max(0) as u64)
    }

    /// Delete matching rows in batches; returns how many went away.
    async fn delete_batched(
        &self,
        table: &str,
        key: &str,
        filter: &str,
        cutoff: i64,
        options: &RetentionOptions,
    ) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE {key} IN (SELECT {key} FROM {table} WHERE {filter} LIMIT ?)"
        );
        let mut deleted = 0u64;
        for _ in 0..options.max_batches {
            let affected = sqlx::query(&sql)
                .bind(cutoff)
                .bind(options.batch_size as i64)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to purge {}", table))?
                .rows_affected();
            deleted += affected;
            if affected < options.batch_size as u64 {
                break;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<SessionState>> {
        let row = sqlx::query("SELECT * FROM chat_session_state WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load session")?;
        Ok(row.as_ref().map(row_to_state))
    }

    async fn upsert(
        &self,
        conversation_id: &str,
        tenant_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionState> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut state = self
            .get(conversation_id)
            .await?
            .unwrap_or_else(|| SessionState::new(conversation_id, tenant_id, now));
        patch.apply(&mut state, now);
        self.redactor.redact_session(&mut state);

        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chat_session_state (
                conversation_id, tenant_id, user_id, state_version,
                last_turn_id, last_trace_id, last_request_id, fallback_count,
                unresolved_context_json, pending_action_json, selection_json, last_ticket_json,
                summary_short, expires_at, created_at, updated_at
            ) VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE SET
                user_id = excluded.user_id,
                state_version = chat_session_state.state_version + 1,
                last_turn_id = excluded.last_turn_id,
                last_trace_id = excluded.last_trace_id,
                last_request_id = excluded.last_request_id,
                fallback_count = excluded.fallback_count,
                unresolved_context_json = excluded.unresolved_context_json,
                pending_action_json = excluded.pending_action_json,
                selection_json = excluded.selection_json,
                last_ticket_json = excluded.last_ticket_json,
                summary_short = excluded.summary_short,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            RETURNING state_version
            "#,
        )
        .bind(&state.conversation_id)
        .bind(&state.tenant_id)
        .bind(&state.user_id)
        .bind(&state.last_turn_id)
        .bind(&state.last_trace_id)
        .bind(&state.last_request_id)
        .bind(state.fallback_count as i64)
        .bind(encode(&state.unresolved_context)?)
        .bind(encode(&state.pending_action)?)
        .bind(encode(&state.selection)?)
        .bind(encode(&state.last_ticket)?)
        .bind(&state.summary_short)
        .bind(state.expires_at.map(to_millis))
        .bind(to_millis(state.created_at))
        .bind(to_millis(state.updated_at))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert session {}", conversation_id))?;

        state.state_version = version;
        Ok(state)
    }

    async fn append_turn_event(&self, event: TurnEvent) -> Result<bool> {
        let payload = self.redactor.redact_json(&event.payload);
        let result = sqlx::query(
            r#"
            INSERT INTO chat_turn_event (
                conversation_id, turn_id, event_type, route, reason_code,
                trace_id, request_id, payload_json, event_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(conversation_id, turn_id, event_type) DO NOTHING
            "#,
        )
        .bind(&event.conversation_id)
        .bind(&event.turn_id)
        .bind(&event.event_type)
        .bind(&event.route)
        .bind(&event.reason_code)
        .bind(&event.trace_id)
        .bind(&event.request_id)
        .bind(payload.to_string())
        .bind(to_millis(event.event_time))
        .execute(&self.pool)
        .await
        .context("Failed to append turn event")?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_action_audit(&self, audit: ActionAudit) -> Result<()> {
        let metadata = self.redactor.redact_json(&audit.metadata);
        let target_ref = audit.target_ref.as_deref().map(|t| self.redactor.redact(t));
        sqlx::query(
            r#"
            INSERT INTO chat_action_audit (
                conversation_id, action_type, action_state, decision, result,
                actor_user_id, actor_admin_id, target_ref, auth_context_json, reason_code,
                idempotency_key, metadata_json, trace_id, request_id, event_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&audit.conversation_id)
        .bind(&audit.action_type)
        .bind(&audit.action_state)
        .bind(audit.decision.as_str())
        .bind(audit.result.as_str())
        .bind(&audit.actor_user_id)
        .bind(&audit.actor_admin_id)
        .bind(target_ref)
        .bind(audit.auth_context.to_string())
        .bind(&audit.reason_code)
        .bind(&audit.idempotency_key)
        .bind(metadata.to_string())
        .bind(&audit.trace_id)
        .bind(&audit.request_id)
        .bind(to_millis(audit.event_time))
        .execute(&self.pool)
        .await
        .context("Failed to append action audit")?;
        Ok(())
    }

    async fn list_turn_events(&self, conversation_id: &str) -> Result<Vec<TurnEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_turn_event WHERE conversation_id = ? ORDER BY id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list turn events")?;
        Ok(rows
            .iter()
            .map(|row| TurnEvent {
                conversation_id: row.get("conversation_id"),
                turn_id: row.get("turn_id"),
                event_type: row.get("event_type"),
                route: row.get("route"),
                reason_code: row.get("reason_code"),
                trace_id: row.get("trace_id"),
                request_id: row.get("request_id"),
                payload: parse_json(row.get("payload_json")),
                event_time: from_millis(row.get("event_time")),
            })
            .collect())
    }

    async fn list_action_audits(&self, conversation_id: &str) -> Result<Vec<ActionAudit>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_action_audit WHERE conversation_id = ? ORDER BY id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list action audits")?;
        Ok(rows
            .iter()
            .map(|row| ActionAudit {
                conversation_id: row.get("conversation_id"),
                action_type: row.get("action_type"),
                action_state: row.get("action_state"),
                decision: parse_decision(row.get("decision")),
                result: parse_result(row.get("result")),
                actor_user_id: row.get("actor_user_id"),
                actor_admin_id: row.get("actor_admin_id"),
                target_ref: row.get("target_ref"),
                auth_context: parse_json(row.get("auth_context_json")),
                reason_code: row.get("reason_code"),
                idempotency_key: row.get("idempotency_key"),
                metadata: parse_json(row.get("metadata_json")),
                trace_id: row.get("trace_id"),
                request_id: row.get("request_id"),
                event_time: from_millis(row.get("event_time")),
            })
            .collect())
    }

    async fn run_retention(&self, options: &RetentionOptions) -> Result<RetentionReport> {
        let now = to_millis(options.now);
        let session_cutoff = to_millis(options.session_cutoff());
        let event_cutoff = to_millis(options.turn_event_cutoff());
        let audit_cutoff = to_millis(options.action_audit_cutoff());

        // Filters take the cutoff as their one bound parameter.
        let session_filter = format!(
            "((expires_at IS NOT NULL AND expires_at <= {}) OR updated_at < ?)",
            now
        );
        let event_filter = "event_time < ?";
        let audit_filter = format!("event_time < ? AND action_type <> '{}'", AUDIT_RETENTION_PURGE);

        let report = if options.dry_run {
            let cap = options.row_cap();
            RetentionReport {
                dry_run: true,
                sessions: self
                    .count_capped("chat_session_state", &session_filter, session_cutoff, cap)
                    .await?,
                turn_events: self
                    .count_capped("chat_turn_event", event_filter, event_cutoff, cap)
                    .await?,
                action_audits: self
                    .count_capped("chat_action_audit", &audit_filter, audit_cutoff, cap)
                    .await?,
            }
        } else {
            RetentionReport {
                dry_run: false,
                sessions: self
                    .delete_batched(
                        "chat_session_state",
                        "conversation_id",
                        &session_filter,
                        session_cutoff,
                        options,
                    )
                    .await?,
                turn_events: self
                    .delete_batched("chat_turn_event", "id", event_filter, event_cutoff, options)
                    .await?,
                action_audits: self
                    .delete_batched("chat_action_audit", "id", &audit_filter, audit_cutoff, options)
                    .await?,
            }
        };

        tracing::info!(
            dry_run = report.dry_run,
            sessions = report.sessions,
            turn_events = report.turn_events,
            action_audits = report.action_audits,
            "retention pass finished"
        );
        self.append_action_audit(retention_audit(&report, options.now))
            .await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_labels_parse_back() {
        for d in [AuditDecision::Allow, AuditDecision::Deny, AuditDecision::Blocked] {
            assert_eq!(parse_decision(d.as_str()), d);
        }
        for r in [
            AuditResult::Success,
            AuditResult::Fail,
            AuditResult::Pending,
            AuditResult::Recorded,
        ] {
            assert_eq!(parse_result(r.as_str()), r);
        }
    }
}

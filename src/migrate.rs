//! Idempotent schema setup.
//!
//! Every statement is `CREATE … IF NOT EXISTS`, so `shelf init` can run
//! against an existing database. Timestamps are epoch milliseconds; loose
//! JSON lives in `*_json` TEXT columns.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const CHAT_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS chat_session_state (
        conversation_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        user_id TEXT,
        state_version INTEGER NOT NULL DEFAULT 0,
        last_turn_id TEXT,
        last_trace_id TEXT,
        last_request_id TEXT,
        fallback_count INTEGER NOT NULL DEFAULT 0,
        unresolved_context_json TEXT,
        pending_action_json TEXT,
        selection_json TEXT,
        last_ticket_json TEXT,
        summary_short TEXT,
        expires_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_turn_event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        turn_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        route TEXT,
        reason_code TEXT,
        trace_id TEXT,
        request_id TEXT,
        payload_json TEXT NOT NULL DEFAULT '{}',
        event_time INTEGER NOT NULL,
        UNIQUE(conversation_id, turn_id, event_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_action_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL,
        action_type TEXT NOT NULL,
        action_state TEXT NOT NULL,
        decision TEXT NOT NULL,
        result TEXT NOT NULL,
        actor_user_id TEXT,
        actor_admin_id TEXT,
        target_ref TEXT,
        auth_context_json TEXT NOT NULL DEFAULT 'null',
        reason_code TEXT NOT NULL,
        idempotency_key TEXT,
        metadata_json TEXT NOT NULL DEFAULT 'null',
        trace_id TEXT,
        request_id TEXT,
        event_time INTEGER NOT NULL
    )
    "#,
];

const REINDEX_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS reindex_job (
        job_id TEXT PRIMARY KEY,
        logical_name TEXT NOT NULL,
        from_physical TEXT,
        to_physical TEXT,
        status TEXT NOT NULL,
        params_json TEXT NOT NULL DEFAULT '{}',
        progress_json TEXT NOT NULL DEFAULT '{}',
        error_json TEXT,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        finished_at INTEGER,
        paused_at INTEGER,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reindex_error (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        doc_id TEXT,
        status INTEGER,
        error_type TEXT,
        reason TEXT,
        action_json TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_index_version (
        physical_name TEXT PRIMARY KEY,
        logical_name TEXT NOT NULL,
        status TEXT NOT NULL,
        doc_count INTEGER,
        created_at INTEGER NOT NULL,
        activated_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_index_alias (
        alias_name TEXT PRIMARY KEY,
        physical_name TEXT NOT NULL,
        is_write_index INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    )
    "#,
];

// Canonical catalog, filled by the external ETL and read by the reindex runner.
const CANONICAL_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS canonical_material (
        material_id INTEGER PRIMARY KEY,
        material_key TEXT NOT NULL UNIQUE,
        title TEXT,
        subtitle TEXT,
        language TEXT,
        issued TEXT,
        publisher TEXT,
        description TEXT,
        material_type TEXT,
        updated_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_override (
        material_id INTEGER PRIMARY KEY,
        title TEXT,
        subtitle TEXT,
        language TEXT,
        issued TEXT,
        publisher TEXT,
        description TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_merge (
        from_material_id INTEGER PRIMARY KEY,
        to_material_key TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_identifier (
        material_id INTEGER NOT NULL,
        scheme TEXT NOT NULL,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_contributor (
        material_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        role TEXT,
        seq INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concept (
        concept_id TEXT PRIMARY KEY,
        label TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_concept (
        material_id INTEGER NOT NULL,
        concept_id TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS material_classification (
        material_id INTEGER NOT NULL,
        scheme TEXT NOT NULL,
        code TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_session_updated_at ON chat_session_state(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_session_expires_at ON chat_session_state(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_turn_event_time ON chat_turn_event(event_time)",
    "CREATE INDEX IF NOT EXISTS idx_turn_event_conv ON chat_turn_event(conversation_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_time ON chat_action_audit(event_time)",
    "CREATE INDEX IF NOT EXISTS idx_audit_conv ON chat_action_audit(conversation_id)",
    "CREATE INDEX IF NOT EXISTS idx_reindex_job_status ON reindex_job(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_reindex_error_job ON reindex_error(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_identifier_material ON material_identifier(material_id)",
    "CREATE INDEX IF NOT EXISTS idx_contributor_material ON material_contributor(material_id)",
    "CREATE INDEX IF NOT EXISTS idx_concept_material ON material_concept(material_id)",
    "CREATE INDEX IF NOT EXISTS idx_classification_material ON material_classification(material_id)",
];

/// Apply the schema to an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in CHAT_TABLES
        .iter()
        .chain(REINDEX_TABLES)
        .chain(CANONICAL_TABLES)
        .chain(INDEXES)
    {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Migration failed: {}", statement.trim()))?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

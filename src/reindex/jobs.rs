//! Reindex job persistence and admin operations.
//!
//! Status changes are compare-and-set on the stored status, so an admin
//! `pause` racing a running worker wins: the worker's next transition
//! finds the row no longer in the stage it left and stops.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use shelf_core::reindex::{
    admin_transition, AdminAction, InvalidTransition, JobError, JobStatus, Progress, ReindexJob,
    ReindexParams,
};

use crate::db::{from_millis, to_millis};
use crate::opensearch::{BulkItem, BulkOp};

/// Why an admin call was refused.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("reindex job {0} not found")]
    NotFound(String),
    #[error("job {active} is still {status} for {logical_name}")]
    Active {
        logical_name: String,
        active: String,
        status: JobStatus,
    },
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("{0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for AdminError {
    fn from(err: anyhow::Error) -> Self {
        AdminError::Store(err)
    }
}

pub const VERSION_BUILDING: &str = "BUILDING";
pub const VERSION_ACTIVE: &str = "ACTIVE";
pub const VERSION_DEPRECATED: &str = "DEPRECATED";

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode reindex job field")
}

fn from_json<T: DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn row_to_job(row: &SqliteRow) -> Result<ReindexJob> {
    let status: String = row.get("status");
    Ok(ReindexJob {
        job_id: row.get("job_id"),
        logical_name: row.get("logical_name"),
        from_physical: row.get("from_physical"),
        to_physical: row.get("to_physical"),
        status: status.parse().map_err(anyhow::Error::msg)?,
        params: from_json(row.get("params_json")),
        progress: from_json(row.get("progress_json")),
        error: row
            .get::<Option<String>, _>("error_json")
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: from_millis(row.get("created_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(from_millis),
        finished_at: row.get::<Option<i64>, _>("finished_at").map(from_millis),
        paused_at: row.get::<Option<i64>, _>("paused_at").map(from_millis),
    })
}

/// Statuses stored as SQL string literals for `NOT IN` filters.
fn terminal_sql() -> String {
    format!(
        "'{}', '{}'",
        JobStatus::Success.as_str(),
        JobStatus::Failed.as_str()
    )
}

#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Admin ============

    /// Create a job unless a non-terminal one exists for the logical name.
    pub async fn create(&self, logical_name: &str, params: ReindexParams) -> Result<ReindexJob, AdminError> {
        let active = sqlx::query(&format!(
            "SELECT job_id, status FROM reindex_job WHERE logical_name = ? AND status NOT IN ({}) \
             ORDER BY created_at LIMIT 1",
            terminal_sql()
        ))
        .bind(logical_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check for active reindex jobs")?;
        if let Some(row) = active {
            let status: String = row.get("status");
            return Err(AdminError::Active {
                logical_name: logical_name.to_string(),
                active: row.get("job_id"),
                status: status.parse().map_err(anyhow::Error::msg)?,
            });
        }

        let now = Utc::now();
        let job = ReindexJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            logical_name: logical_name.to_string(),
            from_physical: None,
            to_physical: None,
            status: JobStatus::Created,
            params,
            progress: Progress::default(),
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            paused_at: None,
        };
        sqlx::query(
            "INSERT INTO reindex_job (job_id, logical_name, status, params_json, progress_json, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(&job.logical_name)
        .bind(job.status.as_str())
        .bind(to_json(&job.params)?)
        .bind(to_json(&job.progress)?)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .context("Failed to insert reindex job")?;

        tracing::info!(job_id = %job.job_id, logical_name, "reindex job created");
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<ReindexJob>> {
        let row = sqlx::query("SELECT * FROM reindex_job WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read reindex job")?;
        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<ReindexJob>> {
        let rows = sqlx::query("SELECT * FROM reindex_job ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list reindex jobs")?;
        rows.iter().map(row_to_job).collect()
    }

    /// Apply `pause`, `resume` or `retry`.
    pub async fn admin(&self, job_id: &str, action: AdminAction) -> Result<ReindexJob, AdminError> {
        let mut job = self
            .get(job_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(job_id.to_string()))?;
        let to = admin_transition(job.status, action)?;
        let now = Utc::now();
        match action {
            AdminAction::Pause => job.paused_at = Some(now),
            AdminAction::Resume => job.paused_at = None,
            AdminAction::Retry => job.progress.attempts += 1,
        }

        let updated = sqlx::query(
            "UPDATE reindex_job SET status = ?, progress_json = COALESCE(?, progress_json), \
             paused_at = ?, updated_at = ? WHERE job_id = ? AND status = ?",
        )
        .bind(to.as_str())
        // Only retry touches progress; a pause must not roll back a concurrent checkpoint.
        .bind(match action {
            AdminAction::Retry => Some(to_json(&job.progress)?),
            AdminAction::Pause | AdminAction::Resume => None,
        })
        .bind(job.paused_at.map(to_millis))
        .bind(to_millis(now))
        .bind(job_id)
        .bind(job.status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update reindex job")?;
        if updated.rows_affected() == 0 {
            // The worker moved the job between our read and write.
            let current = self.status(job_id).await?.unwrap_or(job.status);
            return Err(InvalidTransition {
                from: current,
                action,
            }
            .into());
        }

        tracing::info!(job_id, action = action.as_str(), from = %job.status, to = %to, "reindex job updated");
        job.status = to;
        Ok(job)
    }

    // ============ Worker ============

    pub async fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM reindex_job WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read reindex job status")?;
        status
            .map(|s| s.parse().map_err(anyhow::Error::msg))
            .transpose()
    }

    /// Claim the oldest claimable job by moving it to `PREPARE`.
    pub async fn claim_next(&self) -> Result<Option<ReindexJob>> {
        loop {
            let row = sqlx::query(
                "SELECT * FROM reindex_job WHERE status IN (?, ?, ?) ORDER BY created_at LIMIT 1",
            )
            .bind(JobStatus::Created.as_str())
            .bind(JobStatus::Resume.as_str())
            .bind(JobStatus::Retry.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look for claimable reindex jobs")?;
            let Some(row) = row else {
                return Ok(None);
            };
            let mut job = row_to_job(&row)?;
            let from = job.status;
            job.started_at.get_or_insert_with(Utc::now);
            job.error = None;
            if self.transition(&mut job, JobStatus::Prepare).await? {
                tracing::info!(job_id = %job.job_id, from = %from, "reindex job claimed");
                return Ok(Some(job));
            }
        }
    }

    /// Move `job` from its current status to `to`, persisting locations and
    /// progress with it. Returns `false` when someone else changed the
    /// status first; `job` is left unchanged then.
    pub async fn transition(&self, job: &mut ReindexJob, to: JobStatus) -> Result<bool> {
        let now = Utc::now();
        let finished_at = if to.is_terminal() { Some(now) } else { job.finished_at };
        let error_json = job.error.as_ref().map(to_json).transpose()?;
        let updated = sqlx::query(
            "UPDATE reindex_job SET status = ?, from_physical = ?, to_physical = ?, progress_json = ?, \
             error_json = ?, started_at = ?, finished_at = ?, updated_at = ? \
             WHERE job_id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(&job.from_physical)
        .bind(&job.to_physical)
        .bind(to_json(&job.progress)?)
        .bind(error_json)
        .bind(job.started_at.map(to_millis))
        .bind(finished_at.map(to_millis))
        .bind(to_millis(now))
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to move reindex job to {}", to))?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }
        tracing::debug!(job_id = %job.job_id, from = %job.status, to = %to, "reindex transition");
        job.status = to;
        job.finished_at = finished_at;
        Ok(true)
    }

    /// Persist cursor, stats and index names without touching the status.
    pub async fn checkpoint(&self, job: &ReindexJob) -> Result<()> {
        sqlx::query(
            "UPDATE reindex_job SET from_physical = ?, to_physical = ?, progress_json = ?, updated_at = ? \
             WHERE job_id = ?",
        )
        .bind(&job.from_physical)
        .bind(&job.to_physical)
        .bind(to_json(&job.progress)?)
        .bind(to_millis(Utc::now()))
        .bind(&job.job_id)
        .execute(&self.pool)
        .await
        .context("Failed to checkpoint reindex job")?;
        Ok(())
    }

    /// Mark the job `FAILED`, keeping its cursor.
    pub async fn fail(&self, job: &mut ReindexJob, error: JobError) -> Result<bool> {
        tracing::error!(
            job_id = %job.job_id,
            stage = %error.stage,
            retryable = error.retryable,
            detail = %error.detail,
            "reindex job failed"
        );
        job.error = Some(error);
        self.transition(job, JobStatus::Failed).await
    }

    pub async fn record_error(&self, job_id: &str, op: &BulkOp, item: &BulkItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO reindex_error (job_id, doc_id, status, error_type, reason, action_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(op.id().unwrap_or(item.id.as_str()))
        .bind(item.status as i64)
        .bind(&item.error_type)
        .bind(&item.reason)
        .bind(op.to_record().to_string())
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to record reindex error")?;
        Ok(())
    }

    pub async fn error_count(&self, job_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reindex_error WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count reindex errors")?;
        Ok(count.max(0) as u64)
    }

    // ============ Index versions and aliases ============

    pub async fn register_version(&self, physical: &str, logical: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO search_index_version (physical_name, logical_name, status, created_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT(physical_name) DO NOTHING",
        )
        .bind(physical)
        .bind(logical)
        .bind(VERSION_BUILDING)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to register index version")?;
        Ok(())
    }

    pub async fn version_status(&self, physical: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT status FROM search_index_version WHERE physical_name = ?")
            .bind(physical)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read index version")
    }

    /// Physical index the alias table says `alias` points at.
    pub async fn alias_target(&self, alias: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT physical_name FROM search_index_alias WHERE alias_name = ?")
            .bind(alias)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read index alias")
    }

    /// Mirror a completed swap: alias rows point at `physical`, which
    /// becomes the logical name's only `ACTIVE` version.
    pub async fn record_swap(
        &self,
        logical: &str,
        physical: &str,
        write_alias: &str,
        read_alias: &str,
        doc_count: u64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin swap transaction")?;
        for (alias, is_write) in [(write_alias, true), (read_alias, false)] {
            sqlx::query(
                "INSERT INTO search_index_alias (alias_name, physical_name, is_write_index, updated_at) \
                 VALUES (?, ?, ?, ?) ON CONFLICT(alias_name) DO UPDATE SET \
                 physical_name = excluded.physical_name, is_write_index = excluded.is_write_index, \
                 updated_at = excluded.updated_at",
            )
            .bind(alias)
            .bind(physical)
            .bind(is_write)
            .bind(to_millis(at))
            .execute(&mut *tx)
            .await
            .context("Failed to mirror index alias")?;
        }
        sqlx::query(
            "UPDATE search_index_version SET status = ? \
             WHERE logical_name = ? AND status = ? AND physical_name != ?",
        )
        .bind(VERSION_DEPRECATED)
        .bind(logical)
        .bind(VERSION_ACTIVE)
        .bind(physical)
        .execute(&mut *tx)
        .await
        .context("Failed to deprecate previous index version")?;
        sqlx::query(
            "INSERT INTO search_index_version (physical_name, logical_name, status, doc_count, created_at, activated_at) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(physical_name) DO UPDATE SET \
             status = excluded.status, doc_count = excluded.doc_count, activated_at = excluded.activated_at",
        )
        .bind(physical)
        .bind(logical)
        .bind(VERSION_ACTIVE)
        .bind(doc_count as i64)
        .bind(to_millis(at))
        .bind(to_millis(at))
        .execute(&mut *tx)
        .await
        .context("Failed to activate index version")?;
        tx.commit().await.context("Failed to commit swap transaction")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repo() -> JobRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        JobRepository::new(pool)
    }

    #[tokio::test]
    async fn test_second_active_job_is_refused() {
        let repo = repo().await;
        let first = repo.create("books_doc", ReindexParams::default()).await.unwrap();
        let err = repo.create("books_doc", ReindexParams::default()).await.unwrap_err();
        assert!(matches!(err, AdminError::Active { ref active, .. } if *active == first.job_id));
        assert!(repo.create("authors_doc", ReindexParams::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_admin_transitions() {
        let repo = repo().await;
        let job = repo.create("books_doc", ReindexParams::default()).await.unwrap();

        let err = repo.admin(&job.job_id, AdminAction::Resume).await.unwrap_err();
        assert!(matches!(err, AdminError::InvalidTransition(_)));

        let paused = repo.admin(&job.job_id, AdminAction::Pause).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert!(paused.paused_at.is_some());
        assert!(repo.claim_next().await.unwrap().is_none());

        let resumed = repo.admin(&job.job_id, AdminAction::Resume).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Resume);
        let claimed = repo.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Prepare);
        assert!(claimed.started_at.is_some());

        let missing = repo.admin("nope", AdminAction::Pause).await.unwrap_err();
        assert!(matches!(missing, AdminError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_counts_attempts_and_keeps_cursor() {
        let repo = repo().await;
        repo.create("books_doc", ReindexParams::default()).await.unwrap();
        let mut job = repo.claim_next().await.unwrap().unwrap();
        job.progress.cursor.last_key = Some(42);
        repo.checkpoint(&job).await.unwrap();
        repo.fail(
            &mut job,
            JobError {
                retryable: true,
                stage: "BULK_LOAD".into(),
                detail: "opensearch returned 503".into(),
            },
        )
        .await
        .unwrap();

        let retried = repo.admin(&job.job_id, AdminAction::Retry).await.unwrap();
        assert_eq!(retried.status, JobStatus::Retry);
        assert_eq!(retried.progress.attempts, 1);
        assert_eq!(retried.progress.cursor.last_key, Some(42));
    }

    #[tokio::test]
    async fn test_stale_transition_is_rejected() {
        let repo = repo().await;
        repo.create("books_doc", ReindexParams::default()).await.unwrap();
        let mut job = repo.claim_next().await.unwrap().unwrap();
        repo.admin(&job.job_id, AdminAction::Pause).await.unwrap();
        assert!(!repo.transition(&mut job, JobStatus::BuildIndex).await.unwrap());
        assert_eq!(job.status, JobStatus::Prepare);
        assert_eq!(repo.status(&job.job_id).await.unwrap(), Some(JobStatus::Paused));
    }

    #[tokio::test]
    async fn test_swap_deprecates_previous_version() {
        let repo = repo().await;
        let now = Utc::now();
        repo.register_version("books_doc_1", "books_doc").await.unwrap();
        repo.record_swap("books_doc", "books_doc_1", "w", "r", 10, now).await.unwrap();
        repo.register_version("books_doc_2", "books_doc").await.unwrap();
        assert_eq!(repo.version_status("books_doc_2").await.unwrap().as_deref(), Some(VERSION_BUILDING));
        repo.record_swap("books_doc", "books_doc_2", "w", "r", 12, now).await.unwrap();

        assert_eq!(repo.version_status("books_doc_1").await.unwrap().as_deref(), Some(VERSION_DEPRECATED));
        assert_eq!(repo.version_status("books_doc_2").await.unwrap().as_deref(), Some(VERSION_ACTIVE));
        assert_eq!(repo.alias_target("r").await.unwrap().as_deref(), Some("books_doc_2"));
    }
}

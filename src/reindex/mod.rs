//! Reindex runner.
//!
//! Projects the canonical catalog into a fresh physical index and swaps
//! the read/write aliases onto it:
//!
//! | Stage | Work |
//! |-------|------|
//! | `PREPARE` | resolve source/target indices, create the target from the mapping |
//! | `BUILD_INDEX` | disable refresh for the bulk load |
//! | `BULK_LOAD` | page canonical rows, transform, bulk with per-item retry |
//! | `VERIFY` | restore refresh, require a non-empty index, run smoke queries |
//! | `ALIAS_SWAP` | move both aliases in one `_aliases` call, mirror the swap |
//! | `CLEANUP` | optionally drop older physical indices |
//!
//! Every transition is persisted before the next stage starts. A stage
//! error marks the job `FAILED` with its stage and whether a `retry` can
//! pick it up from the stored cursor.

pub mod jobs;
pub mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use shelf_core::metrics::Metrics;
use shelf_core::reindex::{
    is_transient_bulk_status, physical_index_name, JobError, JobStatus, ReindexJob,
};
use shelf_core::transform::{to_index_document, MaterialBundle};

use crate::config::ReindexConfig;
use crate::opensearch::{search_total, BulkItem, BulkOp, OpenSearchClient, OpenSearchError};

use self::jobs::JobRepository;
use self::source::CanonicalReader;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ReindexError {
    #[error(transparent)]
    Search(#[from] OpenSearchError),
    #[error("store error: {0}")]
    Store(String),
    #[error("mapping unusable: {0}")]
    Mapping(String),
    #[error("failed to encode document {doc_id}: {detail}")]
    Encode { doc_id: String, detail: String },
    #[error("index {0} is empty after bulk load")]
    EmptyIndex(String),
    #[error("{failed} documents failed, above the limit of {max}")]
    TooManyFailures { failed: u64, max: u64 },
    #[error("read alias {alias} counts {alias_count} documents, index has {index_count}")]
    AliasMismatch {
        alias: String,
        alias_count: u64,
        index_count: u64,
    },
}

impl From<anyhow::Error> for ReindexError {
    fn from(err: anyhow::Error) -> Self {
        ReindexError::Store(format!("{:#}", err))
    }
}

impl ReindexError {
    /// Transport, 5xx, 429 and store hiccups can be retried from the cursor.
    pub fn retryable(&self) -> bool {
        match self {
            ReindexError::Search(err) => err.retryable(),
            ReindexError::Store(_) | ReindexError::AliasMismatch { .. } => true,
            ReindexError::Mapping(_)
            | ReindexError::Encode { .. }
            | ReindexError::EmptyIndex(_)
            | ReindexError::TooManyFailures { .. } => false,
        }
    }
}

/// What a stage asks the runner to do next.
enum Flow {
    Continue,
    /// The job left the running states (pause); stop without a transition.
    Stop,
}

/// Effective settings for one job: config overridden by job params.
struct JobSettings {
    batch_size: usize,
    bulk_size: usize,
    delete_existing: bool,
    mapping_path: PathBuf,
}

impl JobSettings {
    fn resolve(config: &ReindexConfig, job: &ReindexJob) -> Self {
        let params = &job.params;
        Self {
            batch_size: params.batch_size.unwrap_or(config.batch_size).max(1),
            bulk_size: params.bulk_size.unwrap_or(config.bulk_size).max(1),
            delete_existing: params.delete_existing.unwrap_or(config.delete_existing),
            mapping_path: params
                .mapping_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| config.mapping_path.clone()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PageStats {
    indexed: u64,
    failed: u64,
    retries: u64,
}

#[derive(Clone)]
pub struct ReindexRunner {
    config: ReindexConfig,
    jobs: JobRepository,
    source: CanonicalReader,
    search: OpenSearchClient,
    metrics: Arc<Metrics>,
}

impl ReindexRunner {
    pub fn new(config: &ReindexConfig, pool: SqlitePool, metrics: Arc<Metrics>) -> Self {
        Self {
            search: OpenSearchClient::new(&config.os_url, SEARCH_TIMEOUT),
            source: CanonicalReader::new(pool.clone(), config.lookup_chunk_size),
            jobs: JobRepository::new(pool),
            config: config.clone(),
            metrics,
        }
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.jobs
    }

    /// Claim and run one job. Returns the job as stored afterwards.
    pub async fn run_next(&self) -> Result<Option<ReindexJob>> {
        let Some(job) = self.jobs.claim_next().await? else {
            return Ok(None);
        };
        let job_id = job.job_id.clone();
        self.run(job).await?;
        self.jobs.get(&job_id).await
    }

    /// Poll for claimable jobs until `shutdown` resolves.
    pub async fn run_worker(&self, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        let poll = Duration::from_secs(self.config.job_poll_interval_sec.max(1));
        tokio::pin!(shutdown);
        tracing::info!(poll_sec = poll.as_secs(), "reindex worker started");
        loop {
            match self.run_next().await {
                Ok(Some(job)) => {
                    tracing::info!(job_id = %job.job_id, status = %job.status, "reindex job finished a run");
                    continue;
                }
                Ok(None) => {}
                Err(err) => tracing::error!(error = %format!("{:#}", err), "reindex worker iteration failed"),
            }
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("reindex worker stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Drive a claimed job through its stages.
    pub async fn run(&self, mut job: ReindexJob) -> Result<()> {
        let settings = JobSettings::resolve(&self.config, &job);
        loop {
            let stage = job.status;
            let result = match stage {
                JobStatus::Prepare => self.prepare(&mut job, &settings).await,
                JobStatus::BuildIndex => self.build_index(&job).await,
                JobStatus::BulkLoad => self.bulk_load(&mut job, &settings).await,
                JobStatus::Verify => self.verify(&job).await,
                JobStatus::AliasSwap => self.alias_swap(&job).await,
                JobStatus::Cleanup => self.cleanup(&job, &settings).await,
                JobStatus::Success => {
                    self.metrics.inc("reindex_job_total", &[("result", "success")]);
                    tracing::info!(
                        job_id = %job.job_id,
                        to_physical = ?job.to_physical,
                        processed = job.progress.processed,
                        failed = job.progress.failed,
                        "reindex job succeeded"
                    );
                    return Ok(());
                }
                other => {
                    tracing::info!(job_id = %job.job_id, status = %other, "reindex job not runnable");
                    return Ok(());
                }
            };

            match result {
                Ok(Flow::Continue) => {
                    let Some(next) = stage.next() else {
                        return Ok(());
                    };
                    if !self.jobs.transition(&mut job, next).await? {
                        let current = self.jobs.status(&job.job_id).await?;
                        tracing::info!(job_id = %job.job_id, stage = %stage, current = ?current, "reindex job changed under the runner; stopping");
                        return Ok(());
                    }
                }
                Ok(Flow::Stop) => {
                    tracing::info!(job_id = %job.job_id, cursor = ?job.progress.cursor.last_key, "reindex job paused");
                    return Ok(());
                }
                Err(err) => {
                    self.metrics.inc("reindex_job_total", &[("result", "failed")]);
                    let error = JobError {
                        retryable: err.retryable(),
                        stage: stage.as_str().to_string(),
                        detail: err.to_string(),
                    };
                    if !self.jobs.fail(&mut job, error).await? {
                        tracing::warn!(job_id = %job.job_id, "reindex job changed before failure was recorded");
                    }
                    return Ok(());
                }
            }
        }
    }

    fn target(job: &ReindexJob) -> Result<&str, ReindexError> {
        job.to_physical
            .as_deref()
            .ok_or_else(|| ReindexError::Store("job has no target index".to_string()))
    }

    // ============ Stages ============

    async fn prepare(&self, job: &mut ReindexJob, settings: &JobSettings) -> Result<Flow, ReindexError> {
        if job.from_physical.is_none() {
            job.from_physical = match self.jobs.alias_target(&self.config.doc_read_alias).await? {
                Some(physical) => Some(physical),
                None => self
                    .search
                    .get_alias(&self.config.doc_read_alias)
                    .await?
                    .into_iter()
                    .next(),
            };
        }
        let target = job
            .to_physical
            .clone()
            .unwrap_or_else(|| physical_index_name(&self.config.index_prefix, Utc::now()));

        let raw = std::fs::read_to_string(&settings.mapping_path).map_err(|e| {
            ReindexError::Mapping(format!("{}: {}", settings.mapping_path.display(), e))
        })?;
        let mapping: Value = serde_json::from_str(&raw).map_err(|e| {
            ReindexError::Mapping(format!("{}: {}", settings.mapping_path.display(), e))
        })?;
        let created = self.search.create_index(&target, &mapping).await?;
        self.jobs.register_version(&target, &job.logical_name).await?;

        job.to_physical = Some(target.clone());
        if job.progress.total == 0 {
            job.progress.total = self.source.count().await?;
        }
        self.jobs.checkpoint(job).await?;
        tracing::info!(
            job_id = %job.job_id,
            from_physical = ?job.from_physical,
            to_physical = %target,
            created,
            total = job.progress.total,
            "reindex prepared"
        );
        Ok(Flow::Continue)
    }

    async fn build_index(&self, job: &ReindexJob) -> Result<Flow, ReindexError> {
        let target = Self::target(job)?;
        self.search
            .put_settings(
                target,
                &json!({ "index": { "refresh_interval": self.config.refresh_interval_bulk } }),
            )
            .await?;
        Ok(Flow::Continue)
    }

    fn bulk_ops(target: &str, bundles: &[MaterialBundle]) -> Result<Vec<BulkOp>, ReindexError> {
        bundles
            .iter()
            .map(|bundle| {
                let doc = to_index_document(bundle);
                let source = serde_json::to_value(&doc).map_err(|e| ReindexError::Encode {
                    doc_id: doc.doc_id.clone(),
                    detail: e.to_string(),
                })?;
                Ok(BulkOp::index(target, &doc.doc_id, source))
            })
            .collect()
    }

    /// Bulk one page in requests of `bulk_size`, retrying transient items.
    async fn write_page(&self, job_id: &str, ops: Vec<BulkOp>, bulk_size: usize) -> Result<PageStats, ReindexError> {
        let mut stats = PageStats::default();
        for request in ops.chunks(bulk_size) {
            let mut pending = request.to_vec();
            let mut attempt = 0u32;
            loop {
                let items = self.search.bulk(&pending).await?;
                let mut again = Vec::new();
                for (op, item) in pending.iter().zip(items.iter()) {
                    if item.ok() {
                        stats.indexed += 1;
                    } else if is_transient_bulk_status(item.status) && attempt < self.config.retry_max {
                        again.push(op.clone());
                    } else {
                        stats.failed += 1;
                        tracing::warn!(
                            job_id,
                            doc_id = %item.id,
                            status = item.status,
                            reason = ?item.reason,
                            "bulk item failed"
                        );
                        self.jobs.record_error(job_id, op, item).await?;
                    }
                }
                // Ops the response has no item for never reached the index.
                for op in pending.iter().skip(items.len()) {
                    let item = BulkItem {
                        id: op.id().unwrap_or_default().to_string(),
                        status: 0,
                        error_type: Some("missing_item".to_string()),
                        reason: Some("bulk response has no item for this action".to_string()),
                    };
                    stats.failed += 1;
                    tracing::warn!(job_id, doc_id = %item.id, "bulk item missing from response");
                    self.jobs.record_error(job_id, op, &item).await?;
                }
                if again.is_empty() {
                    break;
                }
                attempt += 1;
                stats.retries += again.len() as u64;
                tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                pending = again;
            }
        }
        Ok(stats)
    }

    async fn bulk_load(&self, job: &mut ReindexJob, settings: &JobSettings) -> Result<Flow, ReindexError> {
        let target = Self::target(job)?.to_string();
        let mut page = self
            .source
            .load_page(job.progress.cursor.last_key, settings.batch_size)
            .await?;

        while let Some(last) = page.last() {
            let last_key = last.material.material_id;
            let ops = Self::bulk_ops(&target, &page)?;
            // Fetch the next page while this one is being written.
            let (written, next) = tokio::join!(
                self.write_page(&job.job_id, ops, settings.bulk_size),
                self.source.load_page(Some(last_key), settings.batch_size),
            );
            let stats = written?;

            let progress = &mut job.progress;
            progress.processed += stats.indexed;
            progress.failed += stats.failed;
            progress.retries += stats.retries;
            progress.batches += 1;
            progress.cursor.last_key = Some(last_key);
            self.jobs.checkpoint(job).await?;
            self.metrics.inc("reindex_batch_total", &[]);
            self.metrics
                .inc_by("reindex_docs_total", &[("result", "indexed")], stats.indexed as f64);
            self.metrics
                .inc_by("reindex_docs_total", &[("result", "failed")], stats.failed as f64);
            tracing::info!(
                job_id = %job.job_id,
                batch = job.progress.batches,
                processed = job.progress.processed,
                failed = job.progress.failed,
                total = job.progress.total,
                cursor = last_key,
                "reindex batch committed"
            );

            if job.progress.failed > self.config.max_failures {
                return Err(ReindexError::TooManyFailures {
                    failed: job.progress.failed,
                    max: self.config.max_failures,
                });
            }
            if self.jobs.status(&job.job_id).await? == Some(JobStatus::Paused) {
                return Ok(Flow::Stop);
            }
            page = next?;
        }
        Ok(Flow::Continue)
    }

    async fn verify(&self, job: &ReindexJob) -> Result<Flow, ReindexError> {
        let target = Self::target(job)?;
        self.search
            .put_settings(
                target,
                &json!({ "index": { "refresh_interval": self.config.refresh_interval_post } }),
            )
            .await?;
        self.search.refresh(target).await?;
        let count = self.search.count(target).await?;
        if count == 0 {
            return Err(ReindexError::EmptyIndex(target.to_string()));
        }
        for query in &self.config.verify_queries {
            let body = self
                .search
                .search(
                    target,
                    &json!({
                        "size": 0,
                        "track_total_hits": true,
                        "query": { "multi_match": { "query": query, "fields": ["title^3", "authors_ko", "authors_en", "description"] } }
                    }),
                )
                .await?;
            tracing::info!(job_id = %job.job_id, query = %query, hits = search_total(&body), "verify query");
        }
        tracing::info!(job_id = %job.job_id, index = target, count, "reindex verified");
        Ok(Flow::Continue)
    }

    async fn alias_swap(&self, job: &ReindexJob) -> Result<Flow, ReindexError> {
        let target = Self::target(job)?;
        let write_alias = &self.config.doc_alias;
        let read_alias = &self.config.doc_read_alias;

        let mut actions = Vec::new();
        for alias in [write_alias, read_alias] {
            for index in self.search.get_alias(alias).await? {
                if index != target {
                    actions.push(json!({ "remove": { "index": index, "alias": alias } }));
                }
            }
        }
        actions.push(json!({ "add": { "index": target, "alias": write_alias, "is_write_index": true } }));
        actions.push(json!({ "add": { "index": target, "alias": read_alias } }));
        self.search.update_aliases(actions).await?;

        let index_count = self.search.count(target).await?;
        let alias_count = self.search.count(read_alias).await?;
        if alias_count != index_count {
            return Err(ReindexError::AliasMismatch {
                alias: read_alias.clone(),
                alias_count,
                index_count,
            });
        }
        self.jobs
            .record_swap(&job.logical_name, target, write_alias, read_alias, index_count, Utc::now())
            .await?;
        tracing::info!(
            job_id = %job.job_id,
            from_physical = ?job.from_physical,
            to_physical = target,
            doc_count = index_count,
            "aliases swapped"
        );
        Ok(Flow::Continue)
    }

    async fn cleanup(&self, job: &ReindexJob, settings: &JobSettings) -> Result<Flow, ReindexError> {
        if !settings.delete_existing {
            return Ok(Flow::Continue);
        }
        let target = Self::target(job)?;
        let pattern = format!("{}_*", self.config.index_prefix);
        for index in self.search.cat_indices(&pattern).await? {
            if index != target {
                self.search.delete_index(&index).await?;
                tracing::info!(job_id = %job.job_id, index = %index, "old index deleted");
            }
        }
        Ok(Flow::Continue)
    }
}

/// Open the pool and build a runner from the full config.
pub async fn runner_from_config(config: &crate::config::Config, metrics: Arc<Metrics>) -> Result<ReindexRunner> {
    let pool = crate::db::connect(config)
        .await
        .context("Failed to open database for reindex")?;
    Ok(ReindexRunner::new(&config.reindex, pool, metrics))
}

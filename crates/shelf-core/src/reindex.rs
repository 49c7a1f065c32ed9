//! Reindex job state machine.
//!
//! A job walks `CREATED → PREPARE → BUILD_INDEX → BULK_LOAD → VERIFY →
//! ALIAS_SWAP → CLEANUP → SUCCESS`. `RESUME` and `RETRY` re-enter at
//! `PREPARE`, which reuses the stored physical index and cursor. Admin
//! actions move jobs in and out of `PAUSED` and `FAILED`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Prepare,
    BuildIndex,
    BulkLoad,
    Verify,
    AliasSwap,
    Cleanup,
    Success,
    Paused,
    Resume,
    Retry,
    Failed,
}

pub const ALL_STATUSES: &[JobStatus] = &[
    JobStatus::Created,
    JobStatus::Prepare,
    JobStatus::BuildIndex,
    JobStatus::BulkLoad,
    JobStatus::Verify,
    JobStatus::AliasSwap,
    JobStatus::Cleanup,
    JobStatus::Success,
    JobStatus::Paused,
    JobStatus::Resume,
    JobStatus::Retry,
    JobStatus::Failed,
];

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Prepare => "PREPARE",
            JobStatus::BuildIndex => "BUILD_INDEX",
            JobStatus::BulkLoad => "BULK_LOAD",
            JobStatus::Verify => "VERIFY",
            JobStatus::AliasSwap => "ALIAS_SWAP",
            JobStatus::Cleanup => "CLEANUP",
            JobStatus::Success => "SUCCESS",
            JobStatus::Paused => "PAUSED",
            JobStatus::Resume => "RESUME",
            JobStatus::Retry => "RETRY",
            JobStatus::Failed => "FAILED",
        }
    }

    /// The stage that follows this one in a normal run.
    pub fn next(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Created | JobStatus::Resume | JobStatus::Retry => Some(JobStatus::Prepare),
            JobStatus::Prepare => Some(JobStatus::BuildIndex),
            JobStatus::BuildIndex => Some(JobStatus::BulkLoad),
            JobStatus::BulkLoad => Some(JobStatus::Verify),
            JobStatus::Verify => Some(JobStatus::AliasSwap),
            JobStatus::AliasSwap => Some(JobStatus::Cleanup),
            JobStatus::Cleanup => Some(JobStatus::Success),
            JobStatus::Success | JobStatus::Paused | JobStatus::Failed => None,
        }
    }

    /// A worker may pick the job up.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Created | JobStatus::Resume | JobStatus::Retry)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobStatus::Prepare
                | JobStatus::BuildIndex
                | JobStatus::BulkLoad
                | JobStatus::Verify
                | JobStatus::AliasSwap
                | JobStatus::Cleanup
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATUSES
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Pause,
    Resume,
    Retry,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::Pause => "pause",
            AdminAction::Resume => "resume",
            AdminAction::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub action: AdminAction,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} a job in {}", self.action.as_str(), self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Status an admin action moves a job to.
pub fn admin_transition(from: JobStatus, action: AdminAction) -> Result<JobStatus, InvalidTransition> {
    let to = match action {
        AdminAction::Pause if from.is_running() || from == JobStatus::Created => JobStatus::Paused,
        AdminAction::Resume if from == JobStatus::Paused => JobStatus::Resume,
        AdminAction::Retry if from == JobStatus::Failed => JobStatus::Retry,
        _ => return Err(InvalidTransition { from, action }),
    };
    Ok(to)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last canonical material key fully projected.
    #[serde(default)]
    pub last_key: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub retries: u64,
    #[serde(default)]
    pub cursor: Cursor,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub batches: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub retryable: bool,
    pub stage: String,
    pub detail: String,
}

/// Per-job overrides of the `[reindex]` config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_existing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexJob {
    pub job_id: String,
    pub logical_name: String,
    pub from_physical: Option<String>,
    pub to_physical: Option<String>,
    pub status: JobStatus,
    pub params: ReindexParams,
    pub progress: Progress,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
}

/// `<prefix>_<UTC %Y%m%d%H%M%S>`.
pub fn physical_index_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}", prefix, now.format("%Y%m%d%H%M%S"))
}

/// Per-item bulk statuses worth retrying.
pub fn is_transient_bulk_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Whole-request HTTP statuses that make a stage failure retryable.
pub fn is_retryable_http_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_happy_path_order() {
        let mut status = JobStatus::Created;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            status = next;
            seen.push(status);
        }
        assert_eq!(
            seen.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            vec![
                "CREATED",
                "PREPARE",
                "BUILD_INDEX",
                "BULK_LOAD",
                "VERIFY",
                "ALIAS_SWAP",
                "CLEANUP",
                "SUCCESS"
            ]
        );
    }

    #[test]
    fn test_resume_and_retry_reenter_prepare() {
        assert_eq!(JobStatus::Resume.next(), Some(JobStatus::Prepare));
        assert_eq!(JobStatus::Retry.next(), Some(JobStatus::Prepare));
        assert!(JobStatus::Retry.is_claimable());
        assert!(!JobStatus::Paused.is_claimable());
    }

    #[test]
    fn test_admin_transitions() {
        assert_eq!(
            admin_transition(JobStatus::BulkLoad, AdminAction::Pause),
            Ok(JobStatus::Paused)
        );
        assert_eq!(
            admin_transition(JobStatus::Paused, AdminAction::Resume),
            Ok(JobStatus::Resume)
        );
        assert_eq!(
            admin_transition(JobStatus::Failed, AdminAction::Retry),
            Ok(JobStatus::Retry)
        );
        assert!(admin_transition(JobStatus::Success, AdminAction::Pause).is_err());
        assert!(admin_transition(JobStatus::BulkLoad, AdminAction::Resume).is_err());
        assert!(admin_transition(JobStatus::Paused, AdminAction::Retry).is_err());
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in ALL_STATUSES {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(*status));
        }
        assert!("NOPE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_physical_name() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(physical_index_name("books", now), "books_20260102030405");
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_bulk_status(429));
        assert!(is_transient_bulk_status(503));
        assert!(!is_transient_bulk_status(400));
        assert!(!is_transient_bulk_status(500));
        assert!(is_retryable_http_status(500));
        assert!(!is_retryable_http_status(404));
    }
}
